//! Network clients for the noticeboard dashboard.
//!
//! - [`http`]: the Request Client, which attaches bearer credentials and
//!   recovers an expired session once per request
//! - [`credentials`]: where the access/refresh pair is persisted
//! - [`api`]: the REST surface as the [`CampusApi`] trait
//! - [`push`]: the Transport Client for server-pushed change events
//!
//! Enable the `test-utils` feature for in-memory fakes of the API and the
//! push server.

pub mod api;
pub mod credentials;
pub mod http;
pub mod push;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use api::{CampusApi, HttpCampusApi};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use http::{
    ApiRequest, ApiResponse, HttpExecutor, Method, ReqwestExecutor, RequestClient, SessionEvent,
};
pub use push::{
    ClientFrame, ConnectionState, HandlerGuard, PushClient, PushConnection, PushConnector,
    PushMessage, RoomGuard, ServerFrame, WsConnector,
};
