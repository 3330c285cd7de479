//! HTTP request handlers.

pub mod data;
pub mod events;
pub mod status;
pub mod sync;

pub use data::*;
pub use events::*;
pub use status::*;
pub use sync::*;

use crate::access::Requester;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use waffle_core::AccessLevel;

/// Require a server-scope grant of at least `level` for an operator action.
pub(crate) fn require_server_level(
    state: &AppState,
    requester: &Requester,
    level: AccessLevel,
    action: &'static str,
) -> ApiResult<()> {
    if state.access.has_server_level(requester, level) {
        Ok(())
    } else {
        tracing::debug!(user = ?requester.user, action, "Operator action refused");
        Err(ApiError::OperatorUnauthorized { action })
    }
}
