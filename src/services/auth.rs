use crate::backend::auth;
use crate::events::AppEvent;
use crate::models::Session;
use crate::state::ServiceContext;

pub async fn sign_in(ctx: &ServiceContext, email: &str, password: &str) -> Result<Session, String> {
    let session = auth::sign_in_with_password(&ctx.backend, email, password)
        .await
        .map_err(|e| e.to_string())?;
    let _ = ctx.event_tx.send(AppEvent::SignedIn {
        user_id: session.user.id.clone(),
        display_name: session.user.display_name.clone(),
    });
    Ok(session)
}

pub async fn sign_out(ctx: &ServiceContext) -> Result<(), String> {
    auth::sign_out(&ctx.backend).await;
    let _ = ctx.event_tx.send(AppEvent::SignedOut);
    Ok(())
}

pub fn current_session(ctx: &ServiceContext) -> Option<Session> {
    ctx.backend.session()
}
