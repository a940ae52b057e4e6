//! Two execution contexts sharing one store find the stored access token
//! expired at the same moment. Only one of them spends the refresh token;
//! the other adopts the result.
//!
//! Run with `RUST_LOG=info,tabauth=debug` to watch the lock hand-off.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use tabauth::{
    refresh::{refresh_fn, RefreshedCredentials},
    storage::{SharedStorage, Storage},
    CredentialManager, ManagerConfig, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
};
use tabauth_clock::{Clock, System};
use tracing_subscriber::EnvFilter;

fn issue(exp: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none","typ":"JWT"}"#);
    let payload =
        URL_SAFE_NO_PAD.encode(serde_json::json!({ "exp": exp, "sub": "demo" }).to_string());
    format!("{header}.{payload}.unsigned")
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let now = System.now().0;
    let shared = SharedStorage::new();
    let storage = shared.context();
    storage.set(ACCESS_TOKEN_KEY, &issue(now - 60));
    storage.set(REFRESH_TOKEN_KEY, "renewal-0");

    let issued = Arc::new(AtomicUsize::new(0));
    let refresher_for = |context: &'static str| {
        let issued = Arc::clone(&issued);
        refresh_fn(move |refresh_token| {
            let issued = Arc::clone(&issued);
            async move {
                tokio::time::sleep(Duration::from_millis(250)).await;
                let generation = issued.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(
                    context,
                    refresh_token = %refresh_token,
                    generation,
                    "exchanging refresh token"
                );
                Ok(RefreshedCredentials::new(
                    issue(now + 3600),
                    format!("renewal-{generation}"),
                ))
            }
        })
    };

    let mut managers = Vec::new();
    for context in ["first", "second"] {
        let manager = CredentialManager::new(shared.context());
        manager.initialize(
            ManagerConfig::new()
                .with_refresher(refresher_for(context))
                .with_on_change(move |claims| {
                    tracing::info!(
                        context,
                        expiry = ?claims.and_then(|c| c.expiry()),
                        "credentials changed"
                    );
                }),
        )?;
        managers.push(manager);
    }

    for manager in &managers {
        let access = manager.read().await?;
        tracing::info!(token = format_args!("{:#?}", access), "read access token");
    }

    tracing::info!(
        renewals = issued.load(Ordering::SeqCst),
        refresh_token = ?storage.get(REFRESH_TOKEN_KEY),
        "done"
    );

    Ok(())
}
