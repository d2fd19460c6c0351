//! Meeting ids are only unique per tenant. Before routing, each id is
//! combined with the frontend key; responses get the tenant id back.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE, Engine};
use serde_yaml::Value as YamlValue;

use super::BuildContext;
use crate::core::{GatewayResult, Next, RequestContext, RequestMiddleware};
use crate::protocol::{Meeting, Recording, Request, Response, ResponseBody, PARAM_MEETING_ID};

pub const MIDDLEWARE_NAME: &str = "rewrite_unique_meeting_id";

/// Marks ids produced here.
const CHECK_KNOWN_VALUE: &str = "b3scl";

pub fn create_unique_meeting_id_middleware(
    _: &BuildContext,
    _: &YamlValue,
) -> GatewayResult<Arc<dyn RequestMiddleware>> {
    Ok(Arc::new(RewriteUniqueMeetingId))
}

/// Combine a frontend key and a tenant meeting id.
pub fn encode(frontend_key: &str, meeting_id: &str) -> String {
    let repr = [frontend_key, meeting_id, CHECK_KNOWN_VALUE];
    // Serializing an array of strings cannot fail.
    let data = serde_json::to_vec(&repr).unwrap_or_default();
    URL_SAFE.encode(data)
}

/// Split an encoded id into frontend key and tenant meeting id.
pub fn decode(id: &str) -> Option<(String, String)> {
    let data = URL_SAFE.decode(id).ok()?;
    let repr: Vec<String> = serde_json::from_slice(&data).ok()?;
    match <[String; 3]>::try_from(repr) {
        Ok([key, meeting_id, check]) if check == CHECK_KNOWN_VALUE => Some((key, meeting_id)),
        _ => None,
    }
}

/// The tenant id of a possibly encoded id.
fn restore(id: &mut String) {
    if let Some((_, meeting_id)) = decode(id) {
        *id = meeting_id;
    }
}

fn restore_meeting(meeting: &mut Meeting) {
    restore(&mut meeting.meeting_id);
    if let Some(breakout) = meeting.breakout.as_mut() {
        restore(&mut breakout.parent_meeting_id);
    }
}

fn restore_recording(recording: &mut Recording) {
    restore(&mut recording.meeting_id);
    if !recording.metadata.is_empty() {
        recording
            .metadata
            .insert("meetingId".to_string(), recording.meeting_id.clone());
    }
}

fn restore_response(res: &mut Response) {
    match res.body_mut() {
        ResponseBody::Join(join) => restore(&mut join.meeting_id),
        ResponseBody::Create(_, meeting) | ResponseBody::GetMeetingInfo(_, meeting) => {
            restore_meeting(meeting)
        }
        ResponseBody::GetMeetings(_, meetings) => meetings.iter_mut().for_each(restore_meeting),
        ResponseBody::GetRecordings(_, recordings) => {
            recordings.iter_mut().for_each(restore_recording)
        }
        _ => {}
    }
}

pub struct RewriteUniqueMeetingId;

#[async_trait]
impl RequestMiddleware for RewriteUniqueMeetingId {
    fn name(&self) -> &'static str {
        MIDDLEWARE_NAME
    }

    async fn handle(
        &self,
        ctx: &RequestContext,
        mut req: Request,
        next: Next<'_>,
    ) -> GatewayResult<Response> {
        let Some(frontend) = ctx.frontend.as_ref() else {
            return next.run(ctx, req).await;
        };

        if let Some(ids) = req.params.meeting_ids() {
            // Ids already encoded for this frontend are kept, so a
            // request can pass here more than once.
            let encoded: Vec<String> = ids
                .iter()
                .map(|id| match decode(id) {
                    Some((key, _)) if key == frontend.key => id.clone(),
                    _ => encode(&frontend.key, id),
                })
                .collect();
            let encoded = encoded.join(",");
            log::debug!(frontend = frontend.key.as_str(); "rewrote meeting id {ids:?} to {encoded}");
            req.params.insert(PARAM_MEETING_ID, encoded);
        }

        let mut res = next.run(ctx, req).await?;
        restore_response(&mut res);
        Ok(res)
    }
}
