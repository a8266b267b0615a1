pub mod gateway;
pub mod lockout;
pub mod session;
