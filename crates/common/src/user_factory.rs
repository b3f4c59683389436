//! Synthetic bank customers for registration flows

use rand::seq::SliceRandom;
use rand::Rng;
use uuid::Uuid;

use crate::types::User;

/// Password given to every generated user
pub const DEFAULT_PASSWORD: &str = "Password123!";

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bruno", "Carmen", "Dmitri", "Elena", "Farah", "Gustav", "Hana", "Ivan", "Julia",
    "Kwame", "Lena", "Mateo", "Nora", "Omar", "Priya",
];

const LAST_NAMES: &[&str] = &[
    "Anders", "Baker", "Castillo", "Dubois", "Evans", "Fischer", "Garcia", "Hughes", "Ito",
    "Jensen", "Kowalski", "Lopez", "Moreau", "Nakamura", "Okafor", "Patel",
];

const STREETS: &[&str] = &["Main St", "Oak Ave", "Pine Rd", "Maple Dr", "Cedar Ln", "Elm Ct"];

const CITIES: &[(&str, &str)] = &[
    ("Austin", "TX"),
    ("Boston", "MA"),
    ("Denver", "CO"),
    ("Portland", "OR"),
    ("Raleigh", "NC"),
    ("Madison", "WI"),
];

/// Generates unique, realistic-looking users
#[derive(Debug, Clone)]
pub struct UserFactory {
    username_prefix: String,
}

impl Default for UserFactory {
    fn default() -> Self {
        Self::new("user")
    }
}

impl UserFactory {
    pub fn new(username_prefix: impl Into<String>) -> Self {
        Self {
            username_prefix: username_prefix.into(),
        }
    }

    /// Create a user whose username is `<prefix>_<8 hex chars>`
    pub fn create_user(&self) -> User {
        let mut rng = rand::thread_rng();
        let suffix = Uuid::new_v4().simple().to_string();
        let (city, state) = *CITIES.choose(&mut rng).unwrap_or(&("Austin", "TX"));

        User {
            first_name: pick(&mut rng, FIRST_NAMES),
            last_name: pick(&mut rng, LAST_NAMES),
            address: format!("{} {}", rng.gen_range(10..9999), pick(&mut rng, STREETS)),
            city: city.to_string(),
            state: state.to_string(),
            zip_code: format!("{:05}", rng.gen_range(10000..99999)),
            phone: format!(
                "{}-{:03}-{:04}",
                rng.gen_range(200..999),
                rng.gen_range(0..1000),
                rng.gen_range(0..10000)
            ),
            ssn: format!(
                "{:03}-{:02}-{:04}",
                rng.gen_range(100..900),
                rng.gen_range(10..100),
                rng.gen_range(1000..10000)
            ),
            username: format!("{}_{}", self.username_prefix, &suffix[..8]),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

fn pick<R: Rng>(rng: &mut R, values: &[&str]) -> String {
    values.choose(rng).copied().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_usernames_are_unique() {
        let factory = UserFactory::default();
        let names: HashSet<String> = (0..200).map(|_| factory.create_user().username).collect();
        assert_eq!(names.len(), 200);
    }

    #[test]
    fn test_user_shape() {
        let user = UserFactory::new("fallback").create_user();
        assert!(user.username.starts_with("fallback_"));
        assert_eq!(user.username.len(), "fallback_".len() + 8);
        assert_eq!(user.password, DEFAULT_PASSWORD);
        assert_eq!(user.zip_code.len(), 5);
        assert!(!user.first_name.is_empty());
        assert_eq!(user.credentials().username, user.username);
    }
}
