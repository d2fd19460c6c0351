use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Attendee of a meeting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attendee {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub full_name: String,
    pub role: String,
    pub is_presenter: bool,
    pub is_listening_only: bool,
    pub has_joined_voice: bool,
    pub has_video: bool,
    pub client_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Attendees {
    pub attendee: Vec<Attendee>,
}

/// Breakout room information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Breakout {
    #[serde(rename = "parentMeetingID")]
    pub parent_meeting_id: String,
    pub sequence: u32,
    pub free_join: bool,
}

/// A meeting as reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Meeting {
    pub meeting_name: String,
    #[serde(rename = "meetingID")]
    pub meeting_id: String,
    #[serde(rename = "internalMeetingID")]
    pub internal_meeting_id: String,
    pub create_time: i64,
    pub create_date: String,
    pub voice_bridge: String,
    pub dial_number: String,
    #[serde(rename = "attendeePW")]
    pub attendee_pw: String,
    #[serde(rename = "moderatorPW")]
    pub moderator_pw: String,
    pub running: bool,
    pub duration: u32,
    pub recording: bool,
    pub has_been_forcibly_ended: bool,
    pub start_time: i64,
    pub end_time: i64,
    pub participant_count: u32,
    pub listener_count: u32,
    pub voice_participant_count: u32,
    pub video_count: u32,
    pub max_users: u32,
    pub moderator_count: u32,
    pub is_breakout: bool,
    pub metadata: BTreeMap<String, String>,
    pub attendees: Attendees,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakout: Option<Breakout>,
}

impl fmt::Display for Meeting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Meeting id: {}, pc: {}, mc: {}, running: {}]",
            self.meeting_id, self.participant_count, self.moderator_count, self.running
        )
    }
}

/// Playback format of a recording
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Format {
    #[serde(rename = "type")]
    pub format_type: String,
    pub url: String,
    pub processing_time: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Playback {
    pub format: Vec<Format>,
}

/// A recording as reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Recording {
    #[serde(rename = "recordID")]
    pub record_id: String,
    #[serde(rename = "meetingID")]
    pub meeting_id: String,
    #[serde(rename = "internalMeetingID")]
    pub internal_meeting_id: String,
    pub name: String,
    pub is_breakout: bool,
    pub published: bool,
    pub state: String,
    pub start_time: i64,
    pub end_time: i64,
    pub participants: u32,
    pub metadata: BTreeMap<String, String>,
    pub playback: Playback,
}

/// A caption track attached to a recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextTrack {
    pub href: String,
    pub kind: String,
    pub label: String,
    pub lang: String,
    pub source: String,
}
