//! Room server API codec
//!
//! Requests are signed query strings, responses are XML documents
//! (JSON for caption tracks).

pub mod client;
pub mod meeting;
pub mod request;
pub mod response;

pub use client::HttpApiClient;
pub use meeting::{Attendee, Attendees, Breakout, Format, Meeting, Playback, Recording, TextTrack};
pub use request::{
    Params, Request, Resource, PARAM_CHECKSUM, PARAM_DISABLED_FEATURES, PARAM_MEETING_ID,
    PARAM_META_FRONTEND, PARAM_RECORD_ID,
};
pub use response::{
    Envelope, JoinResponse, PutTextTrackResponse, Response, ResponseBody, TextTracksResponse,
    RET_FAILED, RET_SUCCESS,
};
