// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Greeter models the record produced by one greeting request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeter {
    /// Zero until the repository assigns an id.
    pub id: i64,
    pub hello: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Greeter {
    pub fn new(hello: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            hello: hello.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn greeting(&self) -> String {
        format!("Hello {}", self.hello)
    }
}
