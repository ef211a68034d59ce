use serde_json::{json, Value};

use crate::backend::rpc;
use crate::state::ServiceContext;

/// Send a virtual gift. The stored procedure debits the balance and
/// credits the recipient; its JSON result passes through to the UI.
pub async fn send_gift(
    ctx: &ServiceContext,
    recipient_id: &str,
    gift_id: &str,
    session_id: Option<&str>,
) -> Result<Value, String> {
    if ctx.backend.current_user().is_none() {
        return Err("Not signed in".to_string());
    }
    rpc::call(
        &ctx.backend,
        "send_gift",
        json!({
            "recipient_id": recipient_id,
            "gift_id": gift_id,
            "session_id": session_id,
        }),
    )
    .await
    .map_err(|e| e.to_string())
}

/// Buy a coin package. Checkout itself happens on the backend side.
pub async fn purchase_coins(ctx: &ServiceContext, package_id: &str) -> Result<Value, String> {
    if ctx.backend.current_user().is_none() {
        return Err("Not signed in".to_string());
    }
    rpc::call(
        &ctx.backend,
        "purchase_coins",
        json!({ "package_id": package_id }),
    )
    .await
    .map_err(|e| e.to_string())
}
