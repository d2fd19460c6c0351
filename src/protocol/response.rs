use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::meeting::{Meeting, Recording, TextTrack};
use super::request::Resource;
use crate::core::{GatewayError, GatewayResult};

/// Success return code
pub const RET_SUCCESS: &str = "SUCCESS";
/// Failure return code
pub const RET_FAILED: &str = "FAILED";

/// Message keys that only say a listing was empty.
const EMPTY_LISTING_KEYS: [&str; 2] = ["noMeetings", "noRecordings"];

/// The envelope shared by all XML responses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Envelope {
    pub returncode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Envelope {
    pub fn success() -> Self {
        Self {
            returncode: RET_SUCCESS.to_string(),
            ..Default::default()
        }
    }

    pub fn failed(message_key: &str, message: &str) -> Self {
        Self {
            returncode: RET_FAILED.to_string(),
            message: Some(message.to_string()),
            message_key: Some(message_key.to_string()),
            version: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.returncode == RET_SUCCESS
    }

    fn merge(&mut self, other: &Envelope) -> GatewayResult<()> {
        if self.returncode != other.returncode {
            return Err(GatewayError::MergeConflict(format!(
                "returncode {} != {}",
                self.returncode, other.returncode
            )));
        }
        if let (Some(a), Some(b)) = (&self.message_key, &other.message_key) {
            if a != b {
                return Err(GatewayError::MergeConflict(format!("messageKey {a} != {b}")));
            }
        }
        if self.message_key.is_none() {
            self.message_key = other.message_key.clone();
            self.message = other.message.clone();
        }
        if other.version.is_some() {
            self.version = other.version.clone();
        }
        Ok(())
    }

    fn clear_empty_listing(&mut self) {
        if self
            .message_key
            .as_deref()
            .is_some_and(|key| EMPTY_LISTING_KEYS.contains(&key))
        {
            self.message_key = None;
            self.message = None;
        }
    }
}

/// Payload of a join response. Backends usually answer join with a
/// redirect page instead, which is kept raw.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinResponse {
    #[serde(skip)]
    pub envelope: Envelope,
    pub meeting_id: String,
    pub user_id: String,
    pub auth_token: String,
    pub session_token: String,
    pub url: String,
    #[serde(skip)]
    pub raw: Option<Bytes>,
}

impl JoinResponse {
    pub fn raw(body: impl Into<Bytes>) -> Self {
        Self {
            envelope: Envelope::success(),
            raw: Some(body.into()),
            ..Default::default()
        }
    }
}

/// Recording caption tracks, answered as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextTracksResponse {
    pub returncode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub tracks: Vec<TextTrack>,
}

/// Result of uploading a caption track, answered as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PutTextTrackResponse {
    pub returncode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// Typed response payload, one variant per resource.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Envelope(Envelope),
    Create(Envelope, Meeting),
    Join(JoinResponse),
    IsMeetingRunning(Envelope, bool),
    End(Envelope),
    GetMeetingInfo(Envelope, Meeting),
    GetMeetings(Envelope, Vec<Meeting>),
    GetRecordings(Envelope, Vec<Recording>),
    PublishRecordings(Envelope, bool),
    DeleteRecordings(Envelope, bool),
    UpdateRecordings(Envelope, bool),
    GetDefaultConfigXml(Bytes),
    SetConfigXml(Envelope, String),
    GetRecordingTextTracks(TextTracksResponse),
    PutRecordingTextTrack(PutTextTrackResponse),
}

impl ResponseBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Envelope(_) => "envelope",
            ResponseBody::Create(..) => "create",
            ResponseBody::Join(_) => "join",
            ResponseBody::IsMeetingRunning(..) => "isMeetingRunning",
            ResponseBody::End(_) => "end",
            ResponseBody::GetMeetingInfo(..) => "getMeetingInfo",
            ResponseBody::GetMeetings(..) => "getMeetings",
            ResponseBody::GetRecordings(..) => "getRecordings",
            ResponseBody::PublishRecordings(..) => "publishRecordings",
            ResponseBody::DeleteRecordings(..) => "deleteRecordings",
            ResponseBody::UpdateRecordings(..) => "updateRecordings",
            ResponseBody::GetDefaultConfigXml(_) => "getDefaultConfigXML",
            ResponseBody::SetConfigXml(..) => "setConfigXML",
            ResponseBody::GetRecordingTextTracks(_) => "getRecordingTextTracks",
            ResponseBody::PutRecordingTextTrack(_) => "putRecordingTextTrack",
        }
    }

    fn envelope(&self) -> Option<&Envelope> {
        match self {
            ResponseBody::Envelope(e)
            | ResponseBody::Create(e, _)
            | ResponseBody::IsMeetingRunning(e, _)
            | ResponseBody::End(e)
            | ResponseBody::GetMeetingInfo(e, _)
            | ResponseBody::GetMeetings(e, _)
            | ResponseBody::GetRecordings(e, _)
            | ResponseBody::PublishRecordings(e, _)
            | ResponseBody::DeleteRecordings(e, _)
            | ResponseBody::UpdateRecordings(e, _)
            | ResponseBody::SetConfigXml(e, _) => Some(e),
            ResponseBody::Join(join) => Some(&join.envelope),
            ResponseBody::GetDefaultConfigXml(_)
            | ResponseBody::GetRecordingTextTracks(_)
            | ResponseBody::PutRecordingTextTrack(_) => None,
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Join(join) if join.raw.is_some() => "text/html",
            ResponseBody::GetRecordingTextTracks(_) | ResponseBody::PutRecordingTextTrack(_) => {
                "application/json"
            }
            _ => "application/xml",
        }
    }
}

/// A room server API response with its HTTP status and headers.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl Response {
    pub fn new(body: ResponseBody) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(body.content_type()),
        );
        Self {
            status: StatusCode::OK,
            headers,
            body,
        }
    }

    /// A FAILED envelope answered with 200, the way room servers
    /// report expected outcomes.
    pub fn failed(message_key: &str, message: &str) -> Self {
        Self::new(ResponseBody::Envelope(Envelope::failed(message_key, message)))
    }

    pub fn unknown_meeting() -> Self {
        Self::failed(
            "notFound",
            "We could not find a meeting with that meeting ID",
        )
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn header(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn is_success(&self) -> bool {
        match &self.body {
            ResponseBody::GetDefaultConfigXml(_) => self.status.is_success(),
            ResponseBody::GetRecordingTextTracks(r) => r.returncode == RET_SUCCESS,
            ResponseBody::PutRecordingTextTrack(r) => r.returncode == RET_SUCCESS,
            body => body.envelope().is_some_and(Envelope::is_success),
        }
    }

    /// Merge another response of the same type into this one.
    /// Only collections can be merged.
    pub fn merge(&mut self, other: Response) -> GatewayResult<()> {
        let Response {
            status,
            headers,
            body,
        } = other;

        match (&mut self.body, body) {
            (ResponseBody::GetMeetings(env, meetings), ResponseBody::GetMeetings(o_env, o_meetings)) => {
                env.merge(&o_env)?;
                meetings.extend(o_meetings);
                if !meetings.is_empty() {
                    env.clear_empty_listing();
                }
            }
            (
                ResponseBody::GetRecordings(env, recordings),
                ResponseBody::GetRecordings(o_env, o_recordings),
            ) => {
                env.merge(&o_env)?;
                recordings.extend(o_recordings);
                if !recordings.is_empty() {
                    env.clear_empty_listing();
                }
            }
            (ResponseBody::PublishRecordings(env, flag), ResponseBody::PublishRecordings(o_env, o_flag))
            | (ResponseBody::DeleteRecordings(env, flag), ResponseBody::DeleteRecordings(o_env, o_flag))
            | (ResponseBody::UpdateRecordings(env, flag), ResponseBody::UpdateRecordings(o_env, o_flag)) => {
                env.merge(&o_env)?;
                if *flag != o_flag {
                    return Err(GatewayError::MergeConflict("result flags differ".to_string()));
                }
            }
            (ResponseBody::GetRecordingTextTracks(tracks), ResponseBody::GetRecordingTextTracks(o_tracks)) => {
                if tracks.returncode != o_tracks.returncode {
                    return Err(GatewayError::MergeConflict("returncode differs".to_string()));
                }
                tracks.tracks.extend(o_tracks.tracks);
            }
            (body, _) => return Err(GatewayError::CantBeMerged(body.kind())),
        }

        self.status = status;
        self.headers = headers;
        Ok(())
    }

    /// Serialize the body for the wire.
    pub fn marshal(&self) -> GatewayResult<Bytes> {
        match &self.body {
            ResponseBody::Envelope(env) | ResponseBody::End(env) => write_xml(env, EmptyPayload {}),
            ResponseBody::Create(env, meeting) | ResponseBody::GetMeetingInfo(env, meeting) => {
                write_xml(env, meeting)
            }
            ResponseBody::Join(join) => match &join.raw {
                Some(raw) => Ok(raw.clone()),
                None => write_xml(&join.envelope, join),
            },
            ResponseBody::IsMeetingRunning(env, running) => {
                write_xml(env, RunningPayload { running: *running })
            }
            ResponseBody::GetMeetings(env, meetings) => write_xml(
                env,
                MeetingsPayload {
                    meetings: MeetingList {
                        meeting: meetings.clone(),
                    },
                },
            ),
            ResponseBody::GetRecordings(env, recordings) => write_xml(
                env,
                RecordingsPayload {
                    recordings: RecordingList {
                        recording: recordings.clone(),
                    },
                },
            ),
            ResponseBody::PublishRecordings(env, published) => {
                write_xml(env, PublishedPayload { published: *published })
            }
            ResponseBody::DeleteRecordings(env, deleted) => {
                write_xml(env, DeletedPayload { deleted: *deleted })
            }
            ResponseBody::UpdateRecordings(env, updated) => {
                write_xml(env, UpdatedPayload { updated: *updated })
            }
            ResponseBody::GetDefaultConfigXml(config) => Ok(config.clone()),
            ResponseBody::SetConfigXml(env, token) => write_xml(
                env,
                TokenPayload {
                    token: token.clone(),
                },
            ),
            ResponseBody::GetRecordingTextTracks(res) => write_json(res),
            ResponseBody::PutRecordingTextTrack(res) => write_json(res),
        }
    }

    /// Decode a backend answer for the given resource.
    pub fn unmarshal(resource: Resource, data: &[u8]) -> GatewayResult<Response> {
        let body = match resource {
            Resource::Index => ResponseBody::Envelope(read_xml::<EmptyPayload>(data)?.0),
            Resource::End => ResponseBody::End(read_xml::<EmptyPayload>(data)?.0),
            Resource::Join => match read_xml::<JoinResponse>(data) {
                Ok((envelope, mut join)) if !envelope.returncode.is_empty() => {
                    join.envelope = envelope;
                    ResponseBody::Join(join)
                }
                _ => ResponseBody::Join(JoinResponse::raw(Bytes::copy_from_slice(data))),
            },
            Resource::Create => {
                let (env, meeting) = read_xml::<Meeting>(data)?;
                ResponseBody::Create(env, meeting)
            }
            Resource::IsMeetingRunning => {
                let (env, payload) = read_xml::<RunningPayload>(data)?;
                ResponseBody::IsMeetingRunning(env, payload.running)
            }
            Resource::GetMeetingInfo => {
                let (env, meeting) = read_xml::<Meeting>(data)?;
                ResponseBody::GetMeetingInfo(env, meeting)
            }
            Resource::GetMeetings => {
                let (env, payload) = read_xml::<MeetingsPayload>(data)?;
                ResponseBody::GetMeetings(env, payload.meetings.meeting)
            }
            Resource::GetRecordings => {
                let (env, payload) = read_xml::<RecordingsPayload>(data)?;
                ResponseBody::GetRecordings(env, payload.recordings.recording)
            }
            Resource::PublishRecordings => {
                let (env, payload) = read_xml::<PublishedPayload>(data)?;
                ResponseBody::PublishRecordings(env, payload.published)
            }
            Resource::DeleteRecordings => {
                let (env, payload) = read_xml::<DeletedPayload>(data)?;
                ResponseBody::DeleteRecordings(env, payload.deleted)
            }
            Resource::UpdateRecordings => {
                let (env, payload) = read_xml::<UpdatedPayload>(data)?;
                ResponseBody::UpdateRecordings(env, payload.updated)
            }
            Resource::GetDefaultConfigXml => {
                ResponseBody::GetDefaultConfigXml(Bytes::copy_from_slice(data))
            }
            Resource::SetConfigXml => {
                let (env, payload) = read_xml::<TokenPayload>(data)?;
                ResponseBody::SetConfigXml(env, payload.token)
            }
            Resource::GetRecordingTextTracks => {
                let doc: JsonDocument<TextTracksResponse> = serde_json::from_slice(data)?;
                ResponseBody::GetRecordingTextTracks(doc.response)
            }
            Resource::PutRecordingTextTrack => {
                let doc: JsonDocument<PutTextTrackResponse> = serde_json::from_slice(data)?;
                ResponseBody::PutRecordingTextTrack(doc.response)
            }
        };
        Ok(Response::new(body))
    }
}

#[derive(Serialize)]
struct XmlDocument<'a, T: Serialize> {
    #[serde(flatten)]
    envelope: &'a Envelope,
    #[serde(flatten)]
    payload: T,
}

#[derive(Serialize, Deserialize)]
struct JsonDocument<T> {
    response: T,
}

#[derive(Default, Serialize, Deserialize)]
struct EmptyPayload {}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct RunningPayload {
    running: bool,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct PublishedPayload {
    published: bool,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct DeletedPayload {
    deleted: bool,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct UpdatedPayload {
    updated: bool,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct TokenPayload {
    token: String,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct MeetingList {
    meeting: Vec<Meeting>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct MeetingsPayload {
    meetings: MeetingList,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct RecordingList {
    recording: Vec<Recording>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct RecordingsPayload {
    recordings: RecordingList,
}

fn write_xml<T: Serialize>(envelope: &Envelope, payload: T) -> GatewayResult<Bytes> {
    let doc = XmlDocument { envelope, payload };
    let xml = quick_xml::se::to_string_with_root("response", &doc)?;
    Ok(Bytes::from(xml))
}

fn write_json<T: Serialize>(response: &T) -> GatewayResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(&JsonDocument { response })?))
}

/// Decode envelope and payload from the same document. Unknown
/// elements are skipped by both passes.
fn read_xml<T: DeserializeOwned>(data: &[u8]) -> GatewayResult<(Envelope, T)> {
    let text = std::str::from_utf8(data)
        .map_err(|e| GatewayError::Serialization(e.to_string()))?;
    let envelope: Envelope = quick_xml::de::from_str(text)?;
    let payload: T = quick_xml::de::from_str(text)?;
    Ok((envelope, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meeting(id: &str) -> Meeting {
        Meeting {
            meeting_id: id.to_string(),
            internal_meeting_id: format!("{id}-internal"),
            ..Default::default()
        }
    }

    fn meetings_response(ids: &[&str]) -> Response {
        Response::new(ResponseBody::GetMeetings(
            Envelope::success(),
            ids.iter().map(|id| meeting(id)).collect(),
        ))
    }

    #[test]
    fn test_merge_meeting_lists() {
        let mut a = meetings_response(&["m1", "m2"]);
        let b = meetings_response(&["m3"]);
        a.merge(b).unwrap();

        let ResponseBody::GetMeetings(_, meetings) = a.body() else {
            panic!("unexpected body");
        };
        let mut ids: Vec<_> = meetings.iter().map(|m| m.meeting_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let mut a = meetings_response(&["m3"]);
        a.merge(meetings_response(&["m1", "m2"])).unwrap();
        let ResponseBody::GetMeetings(_, meetings) = a.body() else {
            panic!("unexpected body");
        };
        assert_eq!(meetings.len(), 3);
    }

    #[test]
    fn test_merge_clears_empty_listing_key() {
        let mut empty = Response::new(ResponseBody::GetMeetings(
            Envelope {
                message_key: Some("noMeetings".into()),
                message: Some("no meetings were found on this server".into()),
                ..Envelope::success()
            },
            vec![],
        ));
        empty.merge(meetings_response(&["m1"])).unwrap();
        let ResponseBody::GetMeetings(env, meetings) = empty.body() else {
            panic!("unexpected body");
        };
        assert_eq!(meetings.len(), 1);
        assert!(env.message_key.is_none());
    }

    #[test]
    fn test_merge_conflicting_returncode() {
        let mut a = meetings_response(&["m1"]);
        let b = Response::new(ResponseBody::GetMeetings(
            Envelope::failed("checksumError", "bad checksum"),
            vec![],
        ));
        assert!(matches!(a.merge(b), Err(GatewayError::MergeConflict(_))));
    }

    #[test]
    fn test_singletons_can_not_be_merged() {
        let mut a = Response::new(ResponseBody::Create(Envelope::success(), meeting("m1")));
        let b = Response::new(ResponseBody::Create(Envelope::success(), meeting("m1")));
        assert!(matches!(a.merge(b), Err(GatewayError::CantBeMerged("create"))));

        let mut a = meetings_response(&["m1"]);
        let b = Response::new(ResponseBody::End(Envelope::success()));
        assert!(matches!(a.merge(b), Err(GatewayError::CantBeMerged(_))));
    }

    #[test]
    fn test_merge_publish_flags() {
        let mut a = Response::new(ResponseBody::PublishRecordings(Envelope::success(), true));
        a.merge(Response::new(ResponseBody::PublishRecordings(Envelope::success(), true)))
            .unwrap();
        let err = a
            .merge(Response::new(ResponseBody::PublishRecordings(Envelope::success(), false)))
            .unwrap_err();
        assert!(matches!(err, GatewayError::MergeConflict(_)));
    }

    #[test]
    fn test_unmarshal_get_meetings() {
        let xml = r#"<response>
  <returncode>SUCCESS</returncode>
  <meetings>
    <meeting>
      <meetingName>Room A</meetingName>
      <meetingID>m1</meetingID>
      <internalMeetingID>i1</internalMeetingID>
      <running>true</running>
      <participantCount>3</participantCount>
    </meeting>
    <meeting>
      <meetingName>Room B</meetingName>
      <meetingID>m2</meetingID>
      <internalMeetingID>i2</internalMeetingID>
      <running>false</running>
      <participantCount>0</participantCount>
    </meeting>
  </meetings>
</response>"#;
        let res = Response::unmarshal(Resource::GetMeetings, xml.as_bytes()).unwrap();
        assert!(res.is_success());
        let ResponseBody::GetMeetings(_, meetings) = res.body() else {
            panic!("unexpected body");
        };
        assert_eq!(meetings.len(), 2);
        assert_eq!(meetings[0].meeting_id, "m1");
        assert_eq!(meetings[0].participant_count, 3);
        assert!(meetings[0].running);
        assert_eq!(meetings[1].internal_meeting_id, "i2");
    }

    #[test]
    fn test_unmarshal_failed_envelope() {
        let xml = r#"<response><returncode>FAILED</returncode><messageKey>notFound</messageKey><message>no such meeting</message></response>"#;
        let res = Response::unmarshal(Resource::GetMeetingInfo, xml.as_bytes()).unwrap();
        assert!(!res.is_success());
    }

    #[test]
    fn test_unmarshal_raw_join() {
        let html = b"<html><body>redirecting</body></html>";
        let res = Response::unmarshal(Resource::Join, html).unwrap();
        let ResponseBody::Join(join) = res.body() else {
            panic!("unexpected body");
        };
        assert!(join.raw.is_some());
        assert_eq!(res.marshal().unwrap().as_ref(), html);
    }

    #[test]
    fn test_marshal_envelope() {
        let res = Response::failed("notFound", "unknown meeting");
        let xml = String::from_utf8(res.marshal().unwrap().to_vec()).unwrap();
        assert!(xml.starts_with("<response>"));
        assert!(xml.contains("<returncode>FAILED</returncode>"));
        assert!(xml.contains("<messageKey>notFound</messageKey>"));
        assert_eq!(
            res.header().get(header::CONTENT_TYPE).unwrap(),
            "application/xml"
        );
    }

    #[test]
    fn test_text_tracks_json() {
        let json = br#"{"response":{"returncode":"SUCCESS","tracks":[{"href":"h","kind":"subtitles","label":"English","lang":"en-US","source":"upload"}]}}"#;
        let res = Response::unmarshal(Resource::GetRecordingTextTracks, json).unwrap();
        assert!(res.is_success());
        let out = res.marshal().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["response"]["tracks"][0]["lang"], "en-US");
    }
}
