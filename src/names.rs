//! Façade bus name ownership.
//!
//! The façade name is requested on the target bus without any flags, so if
//! another connection already owns it the request is queued by the bus and
//! the context keeps running without exclusive ownership.

use tracing::{info, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Request name reply codes (from D-Bus spec).
pub mod request_name_reply {
    /// Caller is now the primary owner of the name.
    pub const PRIMARY_OWNER: u32 = 1;
    /// Caller is in queue waiting for the name.
    pub const IN_QUEUE: u32 = 2;
    /// Name is already owned and DO_NOT_QUEUE was specified.
    pub const EXISTS: u32 = 3;
    /// Caller was already the primary owner of the name.
    pub const ALREADY_OWNER: u32 = 4;
}

/// Release name reply codes (from D-Bus spec).
pub mod release_name_reply {
    /// Caller has released the name successfully.
    pub const RELEASED: u32 = 1;
    /// The name does not exist (was not owned by anyone).
    pub const NON_EXISTENT: u32 = 2;
    /// The caller is not the owner of this name.
    pub const NOT_OWNER: u32 = 3;
}

/// Where the façade stands with respect to its bus name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameOwnership {
    /// The façade owns the name.
    Owner,
    /// Another connection owns the name; the request is queued.
    Queued,
    /// Another connection owns the name and the request was not queued.
    Exists,
}

impl NameOwnership {
    /// Interpret a `RequestName` reply code.
    pub fn from_reply_code(code: u32) -> Option<Self> {
        match code {
            request_name_reply::PRIMARY_OWNER | request_name_reply::ALREADY_OWNER => {
                Some(NameOwnership::Owner)
            }
            request_name_reply::IN_QUEUE => Some(NameOwnership::Queued),
            request_name_reply::EXISTS => Some(NameOwnership::Exists),
            _ => None,
        }
    }

    pub fn is_owner(self) -> bool {
        self == NameOwnership::Owner
    }
}

/// Request `name` on the endpoint's bus.
pub async fn acquire(endpoint: &Endpoint, name: &str) -> Result<NameOwnership> {
    let reply = endpoint
        .call_bus("RequestName", &(name, 0u32))
        .await
        .map_err(|e| Error::NameAcquisition {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    let code: u32 = reply.body().deserialize()?;

    let ownership = NameOwnership::from_reply_code(code).ok_or_else(|| Error::NameAcquisition {
        name: name.to_string(),
        reason: format!("unexpected RequestName reply {}", code),
    })?;

    match ownership {
        NameOwnership::Owner => info!(name = %name, bus = %endpoint.selector(), "Acquired bus name"),
        NameOwnership::Queued => warn!(
            name = %name,
            bus = %endpoint.selector(),
            "Bus name is owned by another connection; queued for ownership"
        ),
        NameOwnership::Exists => warn!(
            name = %name,
            bus = %endpoint.selector(),
            "Bus name is owned by another connection"
        ),
    }

    Ok(ownership)
}

/// Give up `name` on the endpoint's bus.
///
/// Returns true if the name was held and is now released.
pub async fn release(endpoint: &Endpoint, name: &str) -> Result<bool> {
    let reply = endpoint.call_bus("ReleaseName", &(name,)).await?;
    let code: u32 = reply.body().deserialize()?;
    match code {
        release_name_reply::RELEASED => {
            info!(name = %name, "Released bus name");
            Ok(true)
        }
        release_name_reply::NON_EXISTENT | release_name_reply::NOT_OWNER => Ok(false),
        other => {
            warn!(name = %name, code = other, "Unexpected ReleaseName reply");
            Ok(false)
        }
    }
}
