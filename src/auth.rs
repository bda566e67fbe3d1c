//! Sign-in wizard: login -> verify-code -> select-role -> success.
//!
//! Each step that talks to the backend is split in two. `begin_*` validates the
//! input, marks the flow busy and hands back a [`Ticket`] describing the request;
//! `finish` applies the reply. A ticket issued before `back()` or `reset()` is
//! stale and its reply is ignored, so a late response can never move the wizard.

use crate::api::{ApiClient, ApiResponse, AuthReply, Provider};
use crate::profile::Profile;
use crate::storage::{AuthStorage, Role, Session};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One-time codes are exactly this many digits
pub const CODE_LENGTH: usize = 6;

/// How long the success screen stays up before routing
pub const DEFAULT_SUCCESS_DELAY: Duration = Duration::from_millis(2000);

const EMAIL_PATTERN: &str = r"^[^@\s]+@[^@\s]+\.[^@\s]+$";

static EMAIL_RE: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(EMAIL_PATTERN));

/// Wizard position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    Login,
    VerifyCode,
    SelectRole,
    Success,
}

impl AuthStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::VerifyCode => "verify-code",
            Self::SelectRole => "select-role",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input rejected before any request was made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    InvalidEmail,
    InvalidCode,
    /// Another request is still outstanding
    Busy,
    WrongStep {
        expected: AuthStep,
        actual: AuthStep,
    },
    NoPendingAttempt,
    Provider(String),
    Internal(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEmail => write!(f, "Please enter a valid email address"),
            Self::InvalidCode => write!(f, "Enter the {}-digit code from your email", CODE_LENGTH),
            Self::Busy => write!(f, "A request is already in progress"),
            Self::WrongStep { expected, actual } => {
                write!(f, "Not available at step {} (needs {})", actual, expected)
            }
            Self::NoPendingAttempt => write!(f, "No sign-in in progress"),
            Self::Provider(msg) => write!(f, "{}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// A backend call the wizard needs made
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    SendCode {
        email: String,
    },
    VerifyCode {
        email: String,
        code: String,
        role: Option<Role>,
    },
    OAuthLogin {
        provider: Provider,
        id_token: String,
        role: Option<Role>,
    },
}

/// Successful payloads of the auth endpoints
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    CodeSent,
    Reply(AuthReply),
}

/// Backend surface the wizard depends on
pub trait AuthApi {
    fn dispatch(&self, request: &AuthRequest) -> ApiResponse<AuthOutcome>;
}

impl AuthApi for ApiClient {
    fn dispatch(&self, request: &AuthRequest) -> ApiResponse<AuthOutcome> {
        match request {
            AuthRequest::SendCode { email } => {
                let resp = self.send_verification_code(email);
                if resp.status == 200 {
                    resp.map(|_: Value| AuthOutcome::CodeSent)
                } else {
                    resp.discard()
                }
            }
            AuthRequest::VerifyCode { email, code, role } => self
                .verify_code(email, code, *role)
                .map(AuthOutcome::Reply),
            AuthRequest::OAuthLogin {
                provider,
                id_token,
                role,
            } => self
                .oauth_login(*provider, id_token, *role)
                .map(AuthOutcome::Reply),
        }
    }
}

/// Third-party identity capability; yields an opaque ID token
pub trait OAuthProvider {
    fn provider(&self) -> Provider;
    fn sign_in(&self) -> Result<String>;
}

/// A credential obtained out of band (e.g. pasted from the provider's page)
pub struct IdTokenCredential {
    provider: Provider,
    id_token: String,
}

impl IdTokenCredential {
    pub fn new(provider: Provider, id_token: &str) -> Self {
        Self {
            provider,
            id_token: id_token.trim().to_string(),
        }
    }
}

impl OAuthProvider for IdTokenCredential {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn sign_in(&self) -> Result<String> {
        if self.id_token.is_empty() {
            anyhow::bail!("No {} credential provided", provider_label(self.provider));
        }
        Ok(self.id_token.clone())
    }
}

/// Apple sign-in placeholder
pub struct AppleSignIn;

impl OAuthProvider for AppleSignIn {
    fn provider(&self) -> Provider {
        Provider::Apple
    }

    fn sign_in(&self) -> Result<String> {
        anyhow::bail!("Apple sign-in is not available yet")
    }
}

fn provider_label(provider: Provider) -> &'static str {
    match provider {
        Provider::Email => "Email",
        Provider::Google => "Google",
        Provider::Apple => "Apple",
    }
}

/// Strip non-digits and cap at six characters, as the code field does while typing
pub fn sanitize_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(CODE_LENGTH)
        .collect()
}

/// Whether `code` can be submitted
pub fn is_complete_code(code: &str) -> bool {
    code.len() == CODE_LENGTH && code.chars().all(|c| c.is_ascii_digit())
}

pub fn is_valid_email(email: &str) -> Result<bool, regex::Error> {
    let re = EMAIL_RE.as_ref().map_err(Clone::clone)?;
    Ok(re.is_match(email))
}

/// Material kept between steps of one sign-in
#[derive(Debug, Clone, PartialEq)]
struct PendingAttempt {
    email: String,
    provider: Provider,
    code: Option<String>,
    credential: Option<String>,
    temp_token: Option<String>,
}

impl PendingAttempt {
    fn email(email: &str) -> Self {
        Self {
            email: email.to_string(),
            provider: Provider::Email,
            code: None,
            credential: None,
            temp_token: None,
        }
    }
}

/// Permission to apply exactly one reply
#[derive(Debug)]
pub struct Ticket {
    generation: u64,
    request: AuthRequest,
}

impl Ticket {
    pub fn request(&self) -> &AuthRequest {
        &self.request
    }
}

/// What `finish` did with a reply
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// The wizard moved to this step
    Advanced(AuthStep),
    /// The request failed; the wizard stayed put with this message
    Stayed(String),
    /// The reply belonged to an abandoned step and was dropped
    Stale,
}

/// The sign-in wizard
pub struct AuthFlow {
    step: AuthStep,
    pending: Option<PendingAttempt>,
    loading: bool,
    error: Option<String>,
    generation: u64,
    session: Option<Session>,
    storage: Arc<AuthStorage>,
}

impl AuthFlow {
    pub fn new(storage: Arc<AuthStorage>) -> Self {
        Self {
            step: AuthStep::Login,
            pending: None,
            loading: false,
            error: None,
            generation: 0,
            session: None,
            storage,
        }
    }

    pub fn step(&self) -> AuthStep {
        self.step
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Email of the sign-in in progress
    pub fn email(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.email.as_str())
    }

    pub fn provider(&self) -> Option<Provider> {
        self.pending.as_ref().map(|p| p.provider)
    }

    /// Session established by this flow
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn guard(&self, expected: AuthStep) -> Result<(), AuthError> {
        if self.loading {
            return Err(AuthError::Busy);
        }
        if self.step != expected {
            return Err(AuthError::WrongStep {
                expected,
                actual: self.step,
            });
        }
        Ok(())
    }

    fn reject(&mut self, err: AuthError) -> AuthError {
        self.error = Some(err.to_string());
        err
    }

    fn issue(&mut self, request: AuthRequest) -> Ticket {
        self.loading = true;
        self.error = None;
        Ticket {
            generation: self.generation,
            request,
        }
    }

    pub fn begin_send_code(&mut self, email: &str) -> Result<Ticket, AuthError> {
        self.guard(AuthStep::Login)?;
        let email = email.trim();
        let valid = is_valid_email(email)
            .map_err(|e| self.reject(AuthError::Internal(e.to_string())))?;
        if !valid {
            return Err(self.reject(AuthError::InvalidEmail));
        }

        self.pending = Some(PendingAttempt::email(email));
        Ok(self.issue(AuthRequest::SendCode {
            email: email.to_string(),
        }))
    }

    pub fn begin_verify(&mut self, code: &str) -> Result<Ticket, AuthError> {
        self.guard(AuthStep::VerifyCode)?;
        if !is_complete_code(code) {
            return Err(self.reject(AuthError::InvalidCode));
        }
        let email = self
            .pending
            .as_ref()
            .map(|p| p.email.clone())
            .ok_or(AuthError::NoPendingAttempt)?;

        Ok(self.issue(AuthRequest::VerifyCode {
            email,
            code: code.to_string(),
            role: None,
        }))
    }

    /// Ask the identity provider for a credential; skips the code step
    pub fn begin_oauth(&mut self, provider: &dyn OAuthProvider) -> Result<Ticket, AuthError> {
        self.guard(AuthStep::Login)?;
        let id_token = match provider.sign_in() {
            Ok(token) => token,
            Err(e) => return Err(self.reject(AuthError::Provider(e.to_string()))),
        };

        Ok(self.issue(AuthRequest::OAuthLogin {
            provider: provider.provider(),
            id_token,
            role: None,
        }))
    }

    /// Re-submit the original verification material together with `role`
    pub fn begin_select_role(&mut self, role: Role) -> Result<Ticket, AuthError> {
        self.guard(AuthStep::SelectRole)?;
        let pending = self.pending.as_ref().ok_or(AuthError::NoPendingAttempt)?;

        let request = match (&pending.credential, &pending.code) {
            (Some(id_token), _) => AuthRequest::OAuthLogin {
                provider: pending.provider,
                id_token: id_token.clone(),
                role: Some(role),
            },
            (None, Some(code)) => AuthRequest::VerifyCode {
                email: pending.email.clone(),
                code: code.clone(),
                role: Some(role),
            },
            (None, None) => return Err(AuthError::NoPendingAttempt),
        };
        Ok(self.issue(request))
    }

    /// Apply the reply for `ticket`
    pub fn finish(&mut self, ticket: Ticket, mut resp: ApiResponse<AuthOutcome>) -> Applied {
        if ticket.generation != self.generation {
            return Applied::Stale;
        }
        self.loading = false;
        self.generation += 1;

        match ticket.request {
            AuthRequest::SendCode { .. } => match resp.data.take() {
                Some(AuthOutcome::CodeSent) if resp.status == 200 => {
                    self.advance(AuthStep::VerifyCode)
                }
                _ => self.stay(resp.error_message("Failed to send verification code")),
            },
            AuthRequest::VerifyCode {
                code, role: None, ..
            } => match resp.data.take() {
                Some(AuthOutcome::Reply(AuthReply::NewUser(new_user))) => {
                    if let Some(pending) = self.pending.as_mut() {
                        pending.code = Some(code);
                        pending.provider = new_user.provider;
                        pending.temp_token = new_user.temp_token;
                    }
                    self.advance(AuthStep::SelectRole)
                }
                Some(AuthOutcome::Reply(AuthReply::Authenticated(auth))) => {
                    self.establish(auth.into_session())
                }
                _ => self.stay(resp.error_message("Verification failed")),
            },
            AuthRequest::OAuthLogin {
                provider,
                id_token,
                role: None,
            } => match resp.data.take() {
                Some(AuthOutcome::Reply(AuthReply::NewUser(new_user))) => {
                    self.pending = Some(PendingAttempt {
                        email: new_user.email,
                        provider,
                        code: None,
                        credential: Some(id_token),
                        temp_token: new_user.temp_token,
                    });
                    self.advance(AuthStep::SelectRole)
                }
                Some(AuthOutcome::Reply(AuthReply::Authenticated(auth))) => {
                    self.establish(auth.into_session())
                }
                _ => {
                    let fallback = format!("{} login failed", provider_label(provider));
                    self.stay(resp.error_message(&fallback))
                }
            },
            // Role-bearing submissions: only a full sign-in counts as success.
            AuthRequest::VerifyCode { role: Some(_), .. }
            | AuthRequest::OAuthLogin { role: Some(_), .. } => match resp.data.take() {
                Some(AuthOutcome::Reply(AuthReply::Authenticated(auth))) => {
                    self.establish(auth.into_session())
                }
                _ => self.stay(resp.error_message("Failed to create account")),
            },
        }
    }

    fn advance(&mut self, step: AuthStep) -> Applied {
        self.step = step;
        self.error = None;
        Applied::Advanced(step)
    }

    fn stay(&mut self, message: String) -> Applied {
        self.error = Some(message.clone());
        Applied::Stayed(message)
    }

    fn establish(&mut self, session: Session) -> Applied {
        if let Err(e) = self.storage.save(&session) {
            return self.stay(format!("Failed to save session: {}", e));
        }
        self.pending = None;
        self.session = Some(session);
        self.advance(AuthStep::Success)
    }

    /// Leave the current step; any reply still in flight becomes stale
    pub fn back(&mut self) {
        self.generation += 1;
        self.loading = false;
        self.error = None;
        if matches!(self.step, AuthStep::VerifyCode | AuthStep::SelectRole) {
            self.pending = None;
            self.step = AuthStep::Login;
        }
    }

    /// Start over from the login step
    pub fn reset(&mut self) {
        self.generation += 1;
        self.step = AuthStep::Login;
        self.pending = None;
        self.loading = false;
        self.error = None;
        self.session = None;
    }

    fn run(&mut self, api: &dyn AuthApi, ticket: Ticket) -> Applied {
        let resp = api.dispatch(ticket.request());
        self.finish(ticket, resp)
    }

    pub fn submit_email(&mut self, api: &dyn AuthApi, email: &str) -> Result<Applied, AuthError> {
        let ticket = self.begin_send_code(email)?;
        Ok(self.run(api, ticket))
    }

    pub fn submit_code(&mut self, api: &dyn AuthApi, code: &str) -> Result<Applied, AuthError> {
        let ticket = self.begin_verify(code)?;
        Ok(self.run(api, ticket))
    }

    pub fn submit_oauth(
        &mut self,
        api: &dyn AuthApi,
        provider: &dyn OAuthProvider,
    ) -> Result<Applied, AuthError> {
        let ticket = self.begin_oauth(provider)?;
        Ok(self.run(api, ticket))
    }

    pub fn submit_role(&mut self, api: &dyn AuthApi, role: Role) -> Result<Applied, AuthError> {
        let ticket = self.begin_select_role(role)?;
        Ok(self.run(api, ticket))
    }
}

/// Where to go once signed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Dashboard,
    CreateProfile,
}

/// Profile lookup used after sign-in
pub trait ProfileLookup {
    fn get_profile(&self) -> ApiResponse<Profile>;
}

impl ProfileLookup for ApiClient {
    fn get_profile(&self) -> ApiResponse<Profile> {
        ApiClient::get_profile(self)
    }
}

/// Only an existing profile leads to the dashboard; any failure means "create one"
pub fn destination_for(resp: &ApiResponse<Profile>) -> Destination {
    if resp.status == 200 && resp.data.is_some() {
        Destination::Dashboard
    } else {
        Destination::CreateProfile
    }
}

/// Success screen timing and routing
pub struct SuccessHandoff {
    pub delay: Duration,
}

impl SuccessHandoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn run(&self, lookup: &dyn ProfileLookup) -> Destination {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        destination_for(&lookup.get_profile())
    }
}
