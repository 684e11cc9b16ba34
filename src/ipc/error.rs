use serde_json::json;

/// Status reported alongside an error code, following HTTP semantics.
pub fn status_for(code: &str) -> u16 {
    match code {
        "bad_params" | "bad_json" | "no_workspace" => 400,
        "missing_token" | "token_expired" | "invalid_token" | "invalid_credentials" => 401,
        "forbidden" => 403,
        "not_found" | "not_implemented" => 404,
        "conflict" => 409,
        "payload_too_large" => 413,
        _ => 500,
    }
}

pub fn ok(id: &str, data: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "success": true,
        "data": data
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "status": status_for(code),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "success": false,
        "message": message.into(),
        "error": error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_statuses() {
        assert_eq!(status_for("bad_params"), 400);
        assert_eq!(status_for("token_expired"), 401);
        assert_eq!(status_for("forbidden"), 403);
        assert_eq!(status_for("not_found"), 404);
        assert_eq!(status_for("conflict"), 409);
        assert_eq!(status_for("db_query_failed"), 500);
    }

    #[test]
    fn error_envelope_shape() {
        let v = err("7", "conflict", "overlap", Some(json!({ "dimension": "class" })));
        assert_eq!(v["success"], false);
        assert_eq!(v["message"], "overlap");
        assert_eq!(v["error"]["status"], 409);
        assert_eq!(v["error"]["details"]["dimension"], "class");
        let v = ok("8", json!({ "x": 1 }));
        assert_eq!(v["success"], true);
        assert_eq!(v["data"]["x"], 1);
    }
}
