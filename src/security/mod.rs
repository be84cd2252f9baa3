pub mod claims;
pub mod middleware;

pub use claims::{AccountClaims, Principal, PrincipalContext};
pub use middleware::auth_middleware;
