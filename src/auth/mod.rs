//! Bearer token authentication with role-based access control.
//!
//! Protected routes sit behind [`require_auth`], which resolves the route
//! template, verifies the access token against the codec and the active
//! token cache, and checks the caller's role against [`RouteAuthorization`].

mod bearer;
mod extractors;
mod ip;
mod middleware;
mod routes;

pub use bearer::bearer_token;
pub use extractors::Authenticated;
pub use ip::{ClientIpHeader, HasHeadersAndExtensions, IpExtractor, extract_client_ip};
pub use middleware::{AuthGate, require_auth};
pub use routes::RouteAuthorization;
