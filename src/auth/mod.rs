// Session module
// Token storage, the session state machine, refresh and credential flows

mod credentials;
mod manager;
pub mod refresh;
mod store;
mod types;

pub use credentials::AuthClient;
pub use manager::{RefreshStart, RefreshTicket, SessionManager, SessionState};
pub use store::{MemoryTokenStore, SqliteTokenStore, TokenStore};
pub use types::{
    token_prefix, AccessToken, ClientRegistration, InvalidationReason, OtpDispatch,
    PrincipalKind, SessionEvent, SessionStatus, TokenPair,
};
