use serde::{Deserialize, Serialize};

/// JWT claims issued by the identity service.
///
/// Only `sub` is read here, as the audit identity on instances and tasks.
/// `tenant_id` is accepted so tokens carrying it still decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub exp: usize,
    pub iat: usize,
}
