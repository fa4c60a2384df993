use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use claret_accounts::{Account, AccountStore, OAuthTokens, now_epoch};
use claret_common::AccountId;
use claret_upstream::{HttpTransport, OAuthAuthenticator, OAuthConfig, TransportConfig};

/// Minimal token endpoint: answers every POST with a fresh bundle and counts
/// how many requests actually arrived.
async fn spawn_token_server(hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            hits.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                // Drain until the end of headers; the body length is small
                // enough to arrive alongside them in practice.
                loop {
                    match socket.read(&mut buf[read..]).await {
                        Ok(0) => break,
                        Ok(n) => {
                            read += n;
                            if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        Err(_) => return,
                    }
                }
                let body = r#"{"access_token":"fresh","refresh_token":"next","expires_in":3600}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}/v1/oauth/token")
}

#[tokio::test]
async fn concurrent_refreshes_hit_the_network_once() {
    let hits = Arc::new(AtomicUsize::new(0));
    let token_url = spawn_token_server(hits.clone()).await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        AccountStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap(),
    );
    let mut account = Account::new(AccountId::new_v4());
    account.oauth = Some(OAuthTokens {
        access_token: "stale".into(),
        refresh_token: "r1".into(),
        expires_at: now_epoch() - 10,
        scopes: vec![],
    });
    let id = account.organization_uuid;
    store.create(account).await.unwrap();

    let transport = Arc::new(HttpTransport::new(TransportConfig::default()).unwrap());
    let authenticator = Arc::new(OAuthAuthenticator::new(
        transport,
        store.clone(),
        OAuthConfig {
            token_url,
            ..OAuthConfig::default()
        },
    ));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let authenticator = authenticator.clone();
        tasks.push(tokio::spawn(
            async move { authenticator.refresh(id).await },
        ));
    }
    for task in tasks {
        let tokens = task.await.unwrap().expect("refresh should succeed");
        assert_eq!(tokens.access_token, "fresh");
    }

    assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one network refresh");

    let account = store.get(id).await.unwrap();
    let tokens = account.oauth.unwrap();
    assert_eq!(tokens.access_token, "fresh");
    assert_eq!(tokens.refresh_token, "next");
    assert!(!account.oauth_invalid);
}

#[tokio::test]
async fn failed_refresh_demotes_account() {
    // Nothing is listening here; the refresh must fail and mark the account.
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        AccountStore::load(dir.path().join("accounts.json"))
            .await
            .unwrap(),
    );
    let mut account = Account::new(AccountId::new_v4());
    account.oauth = Some(OAuthTokens {
        access_token: "stale".into(),
        refresh_token: "r1".into(),
        expires_at: now_epoch() - 10,
        scopes: vec![],
    });
    let id = account.organization_uuid;
    store.create(account).await.unwrap();

    let transport = Arc::new(HttpTransport::new(TransportConfig::default()).unwrap());
    let authenticator = OAuthAuthenticator::new(
        transport,
        store.clone(),
        OAuthConfig {
            token_url: "http://127.0.0.1:9/v1/oauth/token".into(),
            ..OAuthConfig::default()
        },
    );

    let err = authenticator.refresh(id).await.unwrap_err();
    assert!(matches!(
        err,
        claret_common::ProxyError::OAuthRefreshFailed(_)
    ));
    assert!(store.get(id).await.unwrap().oauth_invalid);
}
