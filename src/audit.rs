//! Audit log (spec.md §4.8 step 9): every request, once handled, is
//! classified into `USYS_CONFIG` (mutates the switch DB) or `USER_LOGIN`
//! (session lifecycle) and recorded. Emitted through `tracing` like every
//! other structured log in this crate, and additionally kept in a small
//! ring buffer so `/logs` has something to serve without a real log file.

use std::collections::VecDeque;

use chrono::Utc;
use http::{Method, StatusCode};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditClass {
    UsysConfig,
    UserLogin,
}

impl AuditClass {
    fn as_str(self) -> &'static str {
        match self {
            AuditClass::UsysConfig => "USYS_CONFIG",
            AuditClass::UserLogin => "USER_LOGIN",
        }
    }

    pub fn classify(path: &str) -> Self {
        if path == "/login" || path == "/logout" {
            AuditClass::UserLogin
        } else {
            AuditClass::UsysConfig
        }
    }
}

pub struct AuditLog {
    buffer: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn record(&self, class: AuditClass, username: Option<&str>, method: &Method, path: &str, status: StatusCode) {
        let line = format!(
            "{} [{}] {} {} {} user={}",
            Utc::now().to_rfc3339(),
            class.as_str(),
            method,
            path,
            status.as_u16(),
            username.unwrap_or("-"),
        );
        tracing::info!(target: "audit", class = class.as_str(), method = %method, path, status = status.as_u16(), user = username.unwrap_or("-"));
        let mut buffer = self.buffer.lock();
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(line);
    }

    pub fn tail(&self, limit: usize) -> Vec<String> {
        let buffer = self.buffer.lock();
        buffer.iter().rev().take(limit).rev().cloned().collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
