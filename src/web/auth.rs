//! Dashboard authentication
//!
//! Opaque bearer tokens, in-memory only: every dashboard session dies with
//! the process. No lockout; a bad password is just a 401.

use log::info;
use parking_lot::Mutex;
use std::collections::HashSet;

pub struct DashSessions {
    password: String,
    tokens: Mutex<HashSet<String>>,
}

impl DashSessions {
    /// An empty configured password disables login entirely.
    pub fn new(password: String) -> Self {
        Self {
            password,
            tokens: Mutex::new(HashSet::new()),
        }
    }

    /// Exchange the password for a fresh token.
    pub fn login(&self, password: &str) -> Option<String> {
        if self.password.is_empty() || password != self.password {
            return None;
        }
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.tokens.lock().insert(token.clone());
        info!("Dashboard login");
        Some(token)
    }

    /// Drop a token. Unknown tokens are fine.
    pub fn logout(&self, token: &str) {
        self.tokens.lock().remove(token);
    }

    /// Validate a `Bearer <token>` header value.
    pub fn verify_header(&self, authorization: Option<&str>) -> bool {
        let Some(value) = authorization else {
            return false;
        };
        let Some(token) = value.strip_prefix("Bearer ") else {
            return false;
        };
        self.tokens.lock().contains(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_round_trip() {
        let sessions = DashSessions::new("hunter2".to_string());
        assert!(sessions.login("wrong").is_none());

        let token = sessions.login("hunter2").unwrap();
        let header = format!("Bearer {}", token);
        assert!(sessions.verify_header(Some(&header)));

        sessions.logout(&token);
        assert!(!sessions.verify_header(Some(&header)));
    }

    #[test]
    fn empty_password_disables_login() {
        let sessions = DashSessions::new(String::new());
        assert!(sessions.login("").is_none());
        assert!(sessions.login("anything").is_none());
    }

    #[test]
    fn verify_rejects_malformed_headers() {
        let sessions = DashSessions::new("pw".to_string());
        let token = sessions.login("pw").unwrap();
        assert!(!sessions.verify_header(None));
        assert!(!sessions.verify_header(Some(&token)));
        assert!(!sessions.verify_header(Some("Basic abc")));
    }
}
