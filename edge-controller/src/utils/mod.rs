pub mod password;
pub mod validation;
pub mod www_authenticate;

pub use password::{hash_password, verify_password, Password, PasswordHashString};
pub use validation::ValidatedJson;
pub use www_authenticate::{Challenge, ChallengeError};
