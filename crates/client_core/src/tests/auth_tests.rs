use super::*;
use anyhow::anyhow;
use async_trait::async_trait;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::{collections::VecDeque, sync::Mutex as StdMutex};
use tokio::sync::oneshot;

fn mint(claims: &Value) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(b"server-side-secret"),
    )
    .expect("mint token")
}

fn alice_token(exp_offset_secs: i64) -> String {
    mint(&json!({
        "userId": "u1",
        "username": "alice",
        "exp": Utc::now().timestamp() + exp_offset_secs,
    }))
}

#[derive(Default)]
struct FakeAuthApi {
    /// Scripted validation answers; an empty script answers `Valid("u1")`.
    validations: StdMutex<VecDeque<Result<TokenStatus, String>>>,
    validation_gate: StdMutex<Option<oneshot::Receiver<()>>>,
    issued_token: StdMutex<Option<String>>,
    calls: StdMutex<Vec<String>>,
}

impl FakeAuthApi {
    fn script(&self, answers: Vec<Result<TokenStatus, String>>) {
        *self.validations.lock().unwrap() = answers.into();
    }

    fn issue(&self, token: String) {
        *self.issued_token.lock().unwrap() = Some(token);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn issued(&self) -> Result<String> {
        self.issued_token
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("invalid credentials"))
    }
}

#[async_trait]
impl AuthApi for FakeAuthApi {
    async fn login(&self, username: &str, _password: &str) -> Result<String> {
        self.calls.lock().unwrap().push(format!("login:{username}"));
        self.issued()
    }

    async fn signup(&self, username: &str, _password: &str) -> Result<String> {
        self.calls.lock().unwrap().push(format!("signup:{username}"));
        self.issued()
    }

    async fn validate_token(&self, _token: &str) -> Result<TokenStatus> {
        self.calls.lock().unwrap().push("validate".to_string());
        let gate = self.validation_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        let answer = self.validations.lock().unwrap().pop_front();
        match answer {
            Some(Ok(status)) => Ok(status),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(TokenStatus::Valid("u1".into())),
        }
    }
}

async fn gate_with(options: AuthOptions) -> (AuthGate, Arc<FakeAuthApi>) {
    let store = LocalStore::new("sqlite::memory:").await.expect("store");
    let api = Arc::new(FakeAuthApi::default());
    (AuthGate::new(store, api.clone(), options), api)
}

fn fast_retries() -> AuthOptions {
    AuthOptions {
        retry_delay: Duration::from_millis(1),
        ..AuthOptions::default()
    }
}

#[tokio::test]
async fn future_expiry_resolves_to_authenticated() {
    let (gate, api) = gate_with(fast_retries()).await;
    gate.store()
        .set_bearer_token(&alice_token(3600))
        .await
        .expect("token");

    let state = gate.check_authentication().await.expect("check");
    assert_eq!(
        state,
        AuthState::Authenticated(Identity {
            user_id: "u1".into(),
            username: "alice".to_string(),
        })
    );
    assert_eq!(api.calls(), vec!["validate".to_string()]);
    assert!(gate.store().bearer_token().await.expect("read").is_some());
}

#[tokio::test]
async fn past_expiry_resolves_to_logged_out_without_network() {
    let (gate, api) = gate_with(fast_retries()).await;
    gate.store()
        .set_bearer_token(&alice_token(-60))
        .await
        .expect("token");

    let state = gate.check_authentication().await.expect("check");
    assert_eq!(
        state,
        AuthState::LoggedOut(LogoutReason::InvalidToken(IdentityError::Expired))
    );
    assert!(api.calls().is_empty());
    assert_eq!(gate.store().bearer_token().await.expect("read"), None);
}

#[tokio::test]
async fn missing_token_resolves_to_logged_out() {
    let (gate, _api) = gate_with(fast_retries()).await;
    let state = gate.check_authentication().await.expect("check");
    assert_eq!(
        state,
        AuthState::LoggedOut(LogoutReason::InvalidToken(IdentityError::Missing))
    );
    assert_eq!(state.identity(), None);
}

#[tokio::test]
async fn revoked_token_is_cleared_immediately() {
    let (gate, api) = gate_with(fast_retries()).await;
    gate.store()
        .set_bearer_token(&alice_token(3600))
        .await
        .expect("token");
    api.script(vec![Ok(TokenStatus::Revoked)]);

    let state = gate.check_authentication().await.expect("check");
    assert_eq!(state, AuthState::LoggedOut(LogoutReason::Revoked));
    assert_eq!(api.calls().len(), 1);
    assert_eq!(gate.store().bearer_token().await.expect("read"), None);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (gate, api) = gate_with(fast_retries()).await;
    gate.store()
        .set_bearer_token(&alice_token(3600))
        .await
        .expect("token");
    api.script(vec![
        Err("connection reset".into()),
        Err("502".into()),
        Err("timeout".into()),
        Ok(TokenStatus::Valid("u1".into())),
    ]);

    let state = gate.check_authentication().await.expect("check");
    assert!(matches!(state, AuthState::Authenticated(_)));
    assert_eq!(api.calls().len(), 4);
}

#[tokio::test]
async fn exhausted_retries_log_out() {
    let (gate, api) = gate_with(fast_retries()).await;
    gate.store()
        .set_bearer_token(&alice_token(3600))
        .await
        .expect("token");
    api.script((0..5).map(|_| Err("unreachable".to_string())).collect());

    let state = gate.check_authentication().await.expect("check");
    assert_eq!(state, AuthState::LoggedOut(LogoutReason::ValidationFailed));
    assert_eq!(api.calls().len(), 4);
    assert_eq!(gate.store().bearer_token().await.expect("read"), None);
}

#[tokio::test]
async fn local_only_check_skips_validation() {
    let (gate, api) = gate_with(AuthOptions {
        validate_remotely: false,
        ..fast_retries()
    })
    .await;
    gate.store()
        .set_bearer_token(&alice_token(3600))
        .await
        .expect("token");

    assert!(matches!(
        gate.check_authentication().await.expect("check"),
        AuthState::Authenticated(_)
    ));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn concurrent_checks_share_one_validation() {
    let (gate, api) = gate_with(fast_retries()).await;
    gate.store()
        .set_bearer_token(&alice_token(3600))
        .await
        .expect("token");
    let (release, held) = oneshot::channel();
    *api.validation_gate.lock().unwrap() = Some(held);
    let gate = Arc::new(gate);

    let first = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.check_authentication().await })
    };
    let second = {
        let gate = gate.clone();
        tokio::spawn(async move { gate.check_authentication().await })
    };
    while api.calls().is_empty() {
        tokio::task::yield_now().await;
    }
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    release.send(()).expect("release");

    let first = first.await.expect("join").expect("first");
    let second = second.await.expect("join").expect("second");
    assert_eq!(first, second);
    assert_eq!(api.calls(), vec!["validate".to_string()]);
}

#[tokio::test]
async fn login_validates_input_and_persists_token() {
    let (gate, api) = gate_with(fast_retries()).await;

    let err = gate.login("  ", "pw").await.expect_err("no username");
    assert_eq!(
        err.downcast_ref::<AuthError>(),
        Some(&AuthError::MissingUsername)
    );
    let err = gate.login("alice", "").await.expect_err("no password");
    assert_eq!(
        err.downcast_ref::<AuthError>(),
        Some(&AuthError::MissingPassword)
    );
    assert!(api.calls().is_empty());

    let token = alice_token(3600);
    api.issue(token.clone());
    let identity = gate.login("alice", "pw").await.expect("login");
    assert_eq!(identity.user_id.as_str(), "u1");
    assert_eq!(
        gate.store().bearer_token().await.expect("read"),
        Some(token)
    );

    gate.logout().await.expect("logout");
    assert_eq!(gate.store().bearer_token().await.expect("read"), None);
}

#[tokio::test]
async fn signup_rejects_unusable_token() {
    let (gate, api) = gate_with(fast_retries()).await;
    api.issue(mint(&json!({"username": "bob", "exp": Utc::now().timestamp() + 60})));

    let err = gate.signup("bob", "pw").await.expect_err("no user id");
    assert_eq!(
        err.downcast_ref::<AuthError>(),
        Some(&AuthError::UnusableToken)
    );
    assert_eq!(api.calls(), vec!["signup:bob".to_string()]);
    assert_eq!(gate.store().bearer_token().await.expect("read"), None);
}
