//! Page objects used by the session manager and scenario steps

pub mod home;
pub mod register;

pub use home::HomePage;
pub use register::RegisterPage;
