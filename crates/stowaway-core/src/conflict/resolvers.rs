//! Built-in merge resolvers for resource types with server-owned fields.

use serde_json::Value;

use super::merge::merge_values;

/// Verification state is granted by the server only.
const PROFILE_SERVER_FIELDS: [&str; 3] = ["verification_status", "is_verified", "verified_at"];

/// Engagement counters are aggregated by the server.
const POST_SERVER_FIELDS: [&str; 4] = ["likes_count", "comments_count", "shares_count", "views_count"];

/// Personal fields follow the client; verification fields follow the server.
pub fn merge_user_profile(client: &Value, server: &Value) -> Value {
    merge_with_server_fields(client, server, &PROFILE_SERVER_FIELDS)
}

/// Content follows the client; engagement counters follow the server.
pub fn merge_post(client: &Value, server: &Value) -> Value {
    merge_with_server_fields(client, server, &POST_SERVER_FIELDS)
}

fn merge_with_server_fields(client: &Value, server: &Value, server_fields: &[&str]) -> Value {
    let mut merged = merge_values(client, server);
    if let Some(object) = merged.as_object_mut() {
        for field in server_fields {
            match server.get(*field) {
                Some(value) => {
                    object.insert((*field).to_string(), value.clone());
                }
                None => {
                    object.remove(*field);
                }
            }
        }
    }
    merged
}
