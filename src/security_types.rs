use serde::{Deserialize, Serialize};
use std::fmt;

/// Asset class an order or holding belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SecurityType {
    Equity,
    Option,
    Crypto,
}

impl SecurityType {
    /// Classes in the order cancel-all walks them.
    pub const ALL: [SecurityType; 3] = [SecurityType::Equity, SecurityType::Option, SecurityType::Crypto];

    pub fn label(&self) -> &'static str {
        match self {
            SecurityType::Equity => "equity",
            SecurityType::Option => "option",
            SecurityType::Crypto => "crypto",
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
