use serde_json::Value;

use super::{error_from_response, Backend, BackendError};

/// Invoke a named stored procedure with JSON parameters.
pub async fn call(backend: &Backend, name: &str, params: Value) -> Result<Value, BackendError> {
    let resp = backend
        .request(reqwest::Method::POST, &format!("/rest/v1/rpc/{name}"))
        .json(&params)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    // Void procedures return an empty body.
    let text = resp.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// Read rows from a table. Filters are raw column conditions such as
/// `("callee_id", "eq.<uuid>")`.
pub async fn select(
    backend: &Backend,
    table: &str,
    filters: &[(&str, &str)],
) -> Result<Vec<Value>, BackendError> {
    let mut req = backend
        .request(reqwest::Method::GET, &format!("/rest/v1/{table}"))
        .query(&[("select", "*")]);
    for pair in filters {
        req = req.query(&[pair]);
    }
    let resp = req.send().await?;
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    Ok(resp.json().await?)
}

/// Patch a single row by id.
pub async fn update(
    backend: &Backend,
    table: &str,
    id: &str,
    patch: Value,
) -> Result<(), BackendError> {
    let resp = backend
        .request(reqwest::Method::PATCH, &format!("/rest/v1/{table}"))
        .query(&[("id", format!("eq.{id}"))])
        .header("Prefer", "return=minimal")
        .json(&patch)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(error_from_response(resp).await);
    }
    Ok(())
}
