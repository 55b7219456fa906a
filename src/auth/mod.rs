//! Authentication: token validation, refresh, and route protection.

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, IssuedToken, JwtHandler};
pub use middleware::{auth_middleware, AuthError};
