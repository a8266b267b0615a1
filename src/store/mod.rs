pub mod secure;
pub mod session;
