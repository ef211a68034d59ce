use crate::models::NotificationPrefs;
use crate::state::ServiceContext;

/// Current desktop-notification gates.
pub async fn get_prefs(ctx: &ServiceContext) -> NotificationPrefs {
    ctx.notification_prefs.lock().await.clone()
}

/// Replace the gates. Levels are "all" or "none" per category.
pub async fn set_prefs(
    ctx: &ServiceContext,
    prefs: NotificationPrefs,
) -> Result<NotificationPrefs, String> {
    for (category, level) in [("calls", &prefs.calls), ("streams", &prefs.streams)] {
        if level != "all" && level != "none" {
            return Err(format!("Invalid {category} notification level: {level}"));
        }
    }
    *ctx.notification_prefs.lock().await = prefs.clone();
    Ok(prefs)
}

#[cfg(test)]
mod tests {
    use crate::models::NotificationPrefs;

    #[test]
    fn defaults_allow_everything() {
        let prefs = NotificationPrefs::default();
        assert_eq!(prefs.calls, "all");
        assert_eq!(prefs.streams, "all");
    }
}
