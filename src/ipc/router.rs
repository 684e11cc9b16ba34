use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::auth_accounts::try_handle,
    handlers::schools::try_handle,
    handlers::teachers::try_handle,
    handlers::students::try_handle,
    handlers::classes::try_handle,
    handlers::subjects::try_handle,
    handlers::schedules::try_handle,
    handlers::exams::try_handle,
    handlers::assignments::try_handle,
    handlers::attendance::try_handle,
    handlers::leave::try_handle,
    handlers::notices::try_handle,
    handlers::media::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "dispatch");
    let resp = FAMILIES
        .iter()
        .find_map(|f| f(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });
    redact_internal(state.config.dev_mode, &req, resp)
}

/// Server-side failures keep their code but lose the underlying message
/// outside development mode.
fn redact_internal(dev_mode: bool, req: &Request, mut resp: serde_json::Value) -> serde_json::Value {
    if resp["success"] != false || resp["error"]["status"] != 500 {
        return resp;
    }
    tracing::error!(
        id = %req.id,
        method = %req.method,
        code = %resp["error"]["code"],
        message = %resp["message"],
        "request failed"
    );
    if !dev_mode {
        resp["message"] = serde_json::Value::from("internal server error");
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req() -> Request {
        Request {
            id: "1".into(),
            method: "results.create".into(),
            token: None,
            params: json!({}),
        }
    }

    #[test]
    fn internal_errors_are_redacted_unless_dev_mode() {
        let resp = err("1", "db_query_failed", "no such table: results", None);
        let out = redact_internal(false, &req(), resp.clone());
        assert_eq!(out["message"], "internal server error");
        assert_eq!(out["error"]["code"], "db_query_failed");
        let out = redact_internal(true, &req(), resp);
        assert_eq!(out["message"], "no such table: results");
    }

    #[test]
    fn client_errors_pass_through() {
        let resp = err("1", "conflict", "already exists", None);
        let out = redact_internal(false, &req(), resp);
        assert_eq!(out["message"], "already exists");
    }
}
