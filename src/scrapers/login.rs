//! Interactive X login.
//!
//! Fills the username, optional email confirmation, password and one-time
//! code steps with human-paced input. Any step whose input never shows up
//! is skipped, except the username and password inputs which are required.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::browser::{ensure_navigation, BrowserError, BrowserTab};
use crate::otp::{CodeFilter, CodeOracle, OtpError};

pub const LOGIN_URL: &str = "https://x.com/login";
const CODE_SENDER_DOMAIN: &str = "x.com";

const USERNAME_SELECTOR: &str = r#"[autocomplete="username"]"#;
const CONFIRMATION_SELECTOR: &str = r#"[data-testid="ocfEnterTextTextInput"]"#;
const PASSWORD_SELECTORS: [&str; 2] = [
    r#"[autocomplete="current-password"]"#,
    r#"input[name="password"]"#,
];
const OTP_SELECTORS: [&str; 4] = [
    r#"input[name="challenge_response"]"#,
    r#"input[name="verification_code"]"#,
    r#"input[autocomplete="one-time-code"]"#,
    r#"input[inputmode="numeric"]"#,
];

const FORM_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(5);
const OTP_TIMEOUT: Duration = Duration::from_secs(2);
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal login failures. Each one ends the current account's crawl.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("Login form not available")]
    FormUnavailable,
    #[error("Password input not found")]
    PasswordInputMissing,
    #[error("One-time code required but no email mailbox is configured")]
    OtpUnavailable,
    #[error("One-time code not found in email")]
    OtpNotFound,
    #[error("Login credentials not configured")]
    MissingCredentials,
    #[error("Email lookup failed: {0}")]
    Oracle(#[from] OtpError),
    #[error("Browser error during login: {0}")]
    Browser(#[from] BrowserError),
}

#[derive(Debug, Clone)]
pub struct LoginCredentials {
    pub username: String,
    /// Answer for the "confirm your email" challenge; falls back to the username.
    pub email: Option<String>,
    pub password: String,
}

/// Pacing of simulated human input.
#[derive(Debug, Clone)]
pub struct HumanInput {
    /// Pause before each keystroke and before clicks.
    pub key_delay: Duration,
    /// Bounds of the random pause between pointer moves.
    pub move_pause: (Duration, Duration),
}

impl Default for HumanInput {
    fn default() -> Self {
        Self {
            key_delay: Duration::from_millis(100),
            move_pause: (Duration::from_millis(50), Duration::from_millis(150)),
        }
    }
}

impl HumanInput {
    /// No pauses at all.
    pub fn instant() -> Self {
        Self {
            key_delay: Duration::ZERO,
            move_pause: (Duration::ZERO, Duration::ZERO),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PointerMove {
    x: f64,
    y: f64,
    steps: u32,
    pause: Duration,
}

/// 3 to 5 moves inside the central area of the viewport.
fn plan_pointer_moves(width: f64, height: f64, input: &HumanInput) -> Vec<PointerMove> {
    if width <= 0.0 || height <= 0.0 {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();
    let steps = rng.gen_range(6..=14);
    let (low, high) = (
        input.move_pause.0.as_secs_f64(),
        input.move_pause.1.as_secs_f64().max(input.move_pause.0.as_secs_f64()),
    );
    (0..rng.gen_range(3..=5))
        .map(|_| PointerMove {
            x: rng.gen_range(width * 0.15..=width * 0.85),
            y: rng.gen_range(height * 0.2..=height * 0.8),
            steps,
            pause: Duration::from_secs_f64(rng.gen_range(low..=high)),
        })
        .collect()
}

/// Drives the login form on a tab.
#[derive(Clone)]
pub struct LoginFlow {
    credentials: Option<LoginCredentials>,
    oracle: Option<Arc<dyn CodeOracle>>,
    code_timeout: Duration,
    input: HumanInput,
}

impl LoginFlow {
    pub fn new(credentials: Option<LoginCredentials>) -> Self {
        Self {
            credentials,
            oracle: None,
            code_timeout: Duration::from_secs(120),
            input: HumanInput::default(),
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn CodeOracle>, code_timeout: Duration) -> Self {
        self.oracle = Some(oracle);
        self.code_timeout = code_timeout;
        self
    }

    pub fn with_input(mut self, input: HumanInput) -> Self {
        self.input = input;
        self
    }

    /// Log in on `tab`. Leaves the tab wherever the site lands after login.
    pub async fn login<T: BrowserTab>(&self, tab: &T) -> Result<(), LoginError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(LoginError::MissingCredentials)?;
        let started = Utc::now();
        info!("Logging in as {}", credentials.username);

        ensure_navigation(tab, LOGIN_URL, READY_TIMEOUT).await?;

        let username_input = tab
            .select(USERNAME_SELECTOR, FORM_TIMEOUT)
            .await?
            .ok_or(LoginError::FormUnavailable)?;
        self.move_and_click(tab, &username_input).await?;
        self.submit_slowly(tab, &username_input, &credentials.username)
            .await?;

        if let Some(confirmation) = tab.select(CONFIRMATION_SELECTOR, CONFIRMATION_TIMEOUT).await? {
            info!("Answering email confirmation challenge");
            let answer = credentials.email.as_deref().unwrap_or(&credentials.username);
            self.submit_slowly(tab, &confirmation, answer).await?;
        }

        let mut password_input = None;
        for selector in PASSWORD_SELECTORS {
            password_input = tab.select(selector, FORM_TIMEOUT).await?;
            if password_input.is_some() {
                break;
            }
        }
        let password_input = password_input.ok_or(LoginError::PasswordInputMissing)?;
        self.submit_slowly(tab, &password_input, &credentials.password)
            .await?;

        self.handle_one_time_code(tab, started).await?;

        if let Err(e) = tab.wait_for_ready(READY_TIMEOUT).await {
            warn!("Page not ready after login: {}", e);
        }
        info!("Login submitted for {}", credentials.username);
        Ok(())
    }

    async fn handle_one_time_code<T: BrowserTab>(
        &self,
        tab: &T,
        started: chrono::DateTime<Utc>,
    ) -> Result<(), LoginError> {
        let Some(code_input) = tab.select(&OTP_SELECTORS.join(","), OTP_TIMEOUT).await? else {
            return Ok(());
        };

        let oracle = self.oracle.as_ref().ok_or(LoginError::OtpUnavailable)?;
        let filter = CodeFilter {
            domain: CODE_SENDER_DOMAIN.to_string(),
            since: started,
        };
        let code = oracle
            .wait_for_code(&filter, self.code_timeout)
            .await?
            .ok_or(LoginError::OtpNotFound)?;

        info!("Submitting one-time code");
        self.submit_slowly(tab, &code_input, &code).await?;
        Ok(())
    }

    /// Type one character at a time, then press Enter.
    async fn submit_slowly<T: BrowserTab>(
        &self,
        tab: &T,
        element: &T::Element,
        text: &str,
    ) -> Result<(), BrowserError> {
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            tokio::time::sleep(self.input.key_delay).await;
            tab.send_keys(element, ch.encode_utf8(&mut buf)).await?;
        }
        tokio::time::sleep(self.input.key_delay).await;
        tab.press_enter(element).await
    }

    async fn move_and_click<T: BrowserTab>(
        &self,
        tab: &T,
        element: &T::Element,
    ) -> Result<(), BrowserError> {
        let (width, height) = tab.viewport().await;
        let moves = plan_pointer_moves(width, height, &self.input);
        for step in moves {
            tab.mouse_move(step.x, step.y, step.steps).await?;
            tokio::time::sleep(step.pause).await;
        }

        let (x, y) = tab.element_center(element).await?;
        tab.mouse_move(x, y, 1).await?;
        tokio::time::sleep(self.input.key_delay).await;
        tab.click(element).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{Action, FakeTab};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedOracle {
        code: Option<String>,
        filters: Mutex<Vec<CodeFilter>>,
    }

    #[async_trait]
    impl CodeOracle for FixedOracle {
        async fn wait_for_code(
            &self,
            filter: &CodeFilter,
            _timeout: Duration,
        ) -> Result<Option<String>, OtpError> {
            self.filters.lock().unwrap().push(filter.clone());
            Ok(self.code.clone())
        }
    }

    fn credentials() -> LoginCredentials {
        LoginCredentials {
            username: "dankuser".to_string(),
            email: Some("me@example.test".to_string()),
            password: "hunter2".to_string(),
        }
    }

    fn flow() -> LoginFlow {
        LoginFlow::new(Some(credentials())).with_input(HumanInput::instant())
    }

    fn login_form() -> FakeTab {
        let tab = FakeTab::new();
        tab.element(USERNAME_SELECTOR, 1);
        tab.element(PASSWORD_SELECTORS[0], 1);
        tab
    }

    #[test]
    fn test_pointer_moves_stay_inside_viewport() {
        for _ in 0..20 {
            let moves = plan_pointer_moves(1000.0, 500.0, &HumanInput::default());
            assert!((3..=5).contains(&moves.len()));
            for m in moves {
                assert!((150.0..=850.0).contains(&m.x));
                assert!((100.0..=400.0).contains(&m.y));
                assert!((6..=14).contains(&m.steps));
                assert!(m.pause <= Duration::from_millis(150));
            }
        }
        assert!(plan_pointer_moves(0.0, 500.0, &HumanInput::default()).is_empty());
    }

    #[tokio::test]
    async fn test_login_types_credentials() {
        let tab = login_form();
        flow().login(&tab).await.unwrap();

        assert_eq!(tab.typed_into(USERNAME_SELECTOR), "dankuser");
        assert_eq!(tab.typed_into(PASSWORD_SELECTORS[0]), "hunter2");
        let actions = tab.actions();
        assert_eq!(actions[0], Action::Goto(LOGIN_URL.to_string()));
        assert!(actions.contains(&Action::Click(USERNAME_SELECTOR.to_string())));
        assert!(actions.contains(&Action::PressEnter(PASSWORD_SELECTORS[0].to_string())));
        assert!(actions.contains(&Action::MouseMove));
    }

    #[tokio::test]
    async fn test_login_answers_confirmation_and_falls_back_to_password_name() {
        let tab = FakeTab::new();
        tab.element(USERNAME_SELECTOR, 1);
        tab.element(CONFIRMATION_SELECTOR, 1);
        tab.element(PASSWORD_SELECTORS[1], 1);

        flow().login(&tab).await.unwrap();
        assert_eq!(tab.typed_into(CONFIRMATION_SELECTOR), "me@example.test");
        assert_eq!(tab.typed_into(PASSWORD_SELECTORS[1]), "hunter2");
    }

    #[tokio::test]
    async fn test_missing_username_input_is_terminal() {
        let tab = FakeTab::new();
        let err = flow().login(&tab).await.unwrap_err();
        assert!(matches!(err, LoginError::FormUnavailable));
    }

    #[tokio::test]
    async fn test_missing_password_input_is_terminal() {
        let tab = FakeTab::new();
        tab.element(USERNAME_SELECTOR, 1);
        let err = flow().login(&tab).await.unwrap_err();
        assert!(matches!(err, LoginError::PasswordInputMissing));
    }

    #[tokio::test]
    async fn test_one_time_code_from_oracle() {
        let tab = login_form();
        let otp = OTP_SELECTORS.join(",");
        tab.element(&otp, 1);
        let oracle = Arc::new(FixedOracle {
            code: Some("abc123".to_string()),
            filters: Mutex::new(Vec::new()),
        });

        let before = Utc::now();
        flow()
            .with_oracle(oracle.clone(), Duration::from_secs(1))
            .login(&tab)
            .await
            .unwrap();

        assert_eq!(tab.typed_into(&otp), "abc123");
        let filters = oracle.filters.lock().unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].domain, "x.com");
        assert!(filters[0].since >= before);
    }

    #[tokio::test]
    async fn test_one_time_code_without_oracle_fails() {
        let tab = login_form();
        tab.element(&OTP_SELECTORS.join(","), 1);
        let err = flow().login(&tab).await.unwrap_err();
        assert!(matches!(err, LoginError::OtpUnavailable));
    }

    #[tokio::test]
    async fn test_one_time_code_not_delivered_fails() {
        let tab = login_form();
        tab.element(&OTP_SELECTORS.join(","), 1);
        let oracle = Arc::new(FixedOracle {
            code: None,
            filters: Mutex::new(Vec::new()),
        });
        let err = flow()
            .with_oracle(oracle, Duration::from_millis(10))
            .login(&tab)
            .await
            .unwrap_err();
        assert!(matches!(err, LoginError::OtpNotFound));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let tab = login_form();
        let err = LoginFlow::new(None).login(&tab).await.unwrap_err();
        assert!(matches!(err, LoginError::MissingCredentials));
    }
}
