//! Meeting binding resolver
//!
//! A meeting is bound lazily to at most one backend and one frontend.
//! Bindings are set with a conditional write on the revision the
//! meeting was read at, so two racing binders can not both win, and
//! are never reassigned afterwards.

use crate::core::{GatewayError, GatewayResult};
use crate::store::{FrontendState, MeetingState, Store};

/// Conditional write attempts before giving up on a contended meeting.
pub(crate) const MAX_WRITE_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingField {
    Backend,
    Frontend,
}

impl BindingField {
    fn as_str(&self) -> &'static str {
        match self {
            BindingField::Backend => "backend",
            BindingField::Frontend => "frontend",
        }
    }

    fn slot<'a>(&self, meeting: &'a mut MeetingState) -> &'a mut Option<String> {
        match self {
            BindingField::Backend => &mut meeting.backend_id,
            BindingField::Frontend => &mut meeting.frontend_id,
        }
    }
}

/// Set a binding on a loaded meeting. Returns whether the record changed.
pub(crate) fn claim(
    meeting: &mut MeetingState,
    field: BindingField,
    owner: &str,
) -> GatewayResult<bool> {
    let meeting_id = meeting.id.clone();
    let slot = field.slot(meeting);
    if let Some(bound) = slot.as_deref() {
        if bound == owner {
            return Ok(false);
        }
        return Err(GatewayError::BindingConflict {
            meeting_id,
            field: field.as_str(),
            bound: bound.to_string(),
            requested: owner.to_string(),
        });
    }
    *slot = Some(owner.to_string());
    Ok(true)
}

async fn bind(
    store: &dyn Store,
    meeting_id: &str,
    field: BindingField,
    owner: &str,
) -> GatewayResult<()> {
    for _ in 0..MAX_WRITE_ATTEMPTS {
        // Unknown meetings have nothing to bind yet.
        let Some(mut meeting) = store.get_meeting(meeting_id).await? else {
            return Ok(());
        };

        match claim(&mut meeting, field, owner) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) => {
                log::error!(meeting_id = meeting_id, owner = owner; "{err}");
                return Err(err);
            }
        }

        meeting.updated_at = chrono::Utc::now();
        if store.compare_and_swap_meeting(&meeting).await?.is_some() {
            log::info!(meeting_id = meeting_id, owner = owner; "bound meeting {}", field.as_str());
            return Ok(());
        }
        log::debug!("meeting {meeting_id} changed while binding, retrying");
    }
    Err(GatewayError::Store(format!(
        "meeting {meeting_id} is too contended to bind"
    )))
}

/// Bind a meeting to the frontend that owns it.
pub async fn bind_meeting_frontend(
    store: &dyn Store,
    meeting_id: &str,
    frontend: &FrontendState,
) -> GatewayResult<()> {
    bind(store, meeting_id, BindingField::Frontend, &frontend.id).await
}

/// Bind a meeting to the backend it runs on.
pub async fn bind_meeting_backend(
    store: &dyn Store,
    meeting_id: &str,
    backend_id: &str,
) -> GatewayResult<()> {
    bind(store, meeting_id, BindingField::Backend, backend_id).await
}
