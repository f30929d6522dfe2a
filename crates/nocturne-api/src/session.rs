// ── Session state machine ──
//
// Pure token/backoff bookkeeping for one account. No I/O lives here:
// `CloudClient` drives the HTTP flows and holds this behind a single
// mutex so that read-check-act on the token pair never races with a
// concurrent refresh. Every time-dependent check takes `now` (unix
// seconds) so the unit tests need no clock control.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::SecretString;

/// Seconds before the decoded expiry at which a token counts as expiring.
pub const DEFAULT_EXPIRY_BUFFER_SECS: i64 = 300;

/// Fixed delays for auth attempts 1-3, indexed by `min(attempt - 1, 2)`.
const AUTH_RETRY_DELAYS_SECS: [i64; 3] = [30, 120, 300];

/// Consecutive failures before the long cool-down kicks in.
const MAX_AUTH_ATTEMPTS: u32 = 3;

/// Cool-down after the retry limit is reached. Protects the upstream
/// account from MFA-challenge spam triggered by rapid retries.
const AUTH_LOCKOUT_SECS: i64 = 1800;

/// Whether an authentication attempt may proceed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthGate {
    /// No backoff active, go ahead.
    Allowed,
    /// Still inside a backoff or lockout window.
    Backoff { retry_in_secs: u64 },
}

/// Mutable session state for one account.
///
/// Invariant: `pending_mfa_token` and a usable `access_token` are never
/// both set -- adopting tokens clears the pending challenge, and a
/// challenge is only recorded after the access token is gone.
#[derive(Debug, Default)]
pub struct Session {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_expires_at: Option<i64>,
    stored_email: Option<String>,
    stored_password: Option<SecretString>,
    pending_mfa_token: Option<String>,
    last_auth_failure: Option<i64>,
    auth_retry_count: u32,
    expiry_buffer_secs: i64,
}

impl Session {
    pub fn new(expiry_buffer_secs: i64) -> Self {
        Self {
            expiry_buffer_secs,
            ..Self::default()
        }
    }

    // ── Credentials ──────────────────────────────────────────────────

    pub fn store_credentials(&mut self, email: &str, password: SecretString) {
        self.stored_email = Some(email.to_owned());
        self.stored_password = Some(password);
    }

    pub fn has_stored_credentials(&self) -> bool {
        matches!(&self.stored_email, Some(e) if !e.trim().is_empty())
            && self.stored_password.is_some()
    }

    pub fn stored_email(&self) -> Option<&str> {
        self.stored_email.as_deref()
    }

    pub fn stored_password(&self) -> Option<&SecretString> {
        self.stored_password.as_ref()
    }

    // ── Tokens ───────────────────────────────────────────────────────

    /// Adopt a fresh access token (and optionally a rotated refresh token)
    /// from a successful login, MFA completion, or refresh.
    ///
    /// Resets backoff counters and clears any pending MFA challenge.
    /// Returns the rotated refresh token, if the server sent one, so the
    /// caller can notify its persistence layer.
    pub fn adopt_tokens(
        &mut self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Option<String> {
        self.token_expires_at = extract_token_expiry(&access_token);
        self.access_token = Some(access_token);
        self.pending_mfa_token = None;
        self.last_auth_failure = None;
        self.auth_retry_count = 0;

        if let Some(rotated) = refresh_token {
            self.refresh_token = Some(rotated.clone());
            Some(rotated)
        } else {
            None
        }
    }

    pub fn set_refresh_token(&mut self, token: Option<String>) {
        self.refresh_token = token;
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn clear_access_token(&mut self) {
        self.access_token = None;
        self.token_expires_at = None;
    }

    /// Drop both tokens. Used when the refresh token is known dead
    /// (404/401 from the refresh endpoint).
    pub fn clear_tokens(&mut self) {
        self.clear_access_token();
        self.refresh_token = None;
    }

    /// Security wipe: tokens, pending MFA, and expiry tracking.
    /// Stored credentials are kept so automatic re-auth can still run;
    /// `close` clears those separately.
    pub fn clear_auth_data(&mut self) {
        self.clear_tokens();
        self.pending_mfa_token = None;
    }

    pub fn clear_stored_credentials(&mut self) {
        self.stored_email = None;
        self.stored_password = None;
    }

    /// True when an unexpired access token is on hand and not within the
    /// expiry buffer of its decoded expiry. A token with no decodable
    /// expiry counts as expiring immediately.
    pub fn token_is_fresh(&self, now: i64) -> bool {
        match (&self.access_token, self.token_expires_at) {
            (Some(_), Some(expires_at)) => now < expires_at - self.expiry_buffer_secs,
            _ => false,
        }
    }

    // ── MFA ──────────────────────────────────────────────────────────

    /// Record an MFA challenge. The access token is dropped first so the
    /// suspended-session invariant holds.
    pub fn set_pending_mfa(&mut self, mfa_token: String) {
        self.clear_access_token();
        self.pending_mfa_token = Some(mfa_token);
    }

    pub fn pending_mfa_token(&self) -> Option<&str> {
        self.pending_mfa_token.as_deref()
    }

    pub fn is_mfa_pending(&self) -> bool {
        self.pending_mfa_token.is_some()
    }

    // ── Backoff ──────────────────────────────────────────────────────

    /// Gate a full authentication attempt on the backoff ladder.
    ///
    /// Attempts 1-3 wait 30s/120s/300s after the previous failure; once
    /// the limit is reached, a 30-minute cool-down applies, after which
    /// the counters reset and attempts resume.
    pub fn auth_gate(&mut self, now: i64) -> AuthGate {
        let Some(failed_at) = self.last_auth_failure else {
            return AuthGate::Allowed;
        };
        let since_failure = now - failed_at;

        if self.auth_retry_count >= MAX_AUTH_ATTEMPTS {
            if since_failure < AUTH_LOCKOUT_SECS {
                return AuthGate::Backoff {
                    retry_in_secs: (AUTH_LOCKOUT_SECS - since_failure).max(0) as u64,
                };
            }
            // Lockout served; reset and allow.
            self.auth_retry_count = 0;
            self.last_auth_failure = None;
            return AuthGate::Allowed;
        }

        if self.auth_retry_count > 0 {
            let idx = ((self.auth_retry_count - 1) as usize).min(AUTH_RETRY_DELAYS_SECS.len() - 1);
            let min_wait = AUTH_RETRY_DELAYS_SECS[idx];
            if since_failure < min_wait {
                return AuthGate::Backoff {
                    retry_in_secs: (min_wait - since_failure).max(0) as u64,
                };
            }
        }

        AuthGate::Allowed
    }

    /// Record an authentication failure for rate limiting.
    /// MFA challenges must not be recorded here.
    pub fn record_auth_failure(&mut self, now: i64) {
        self.last_auth_failure = Some(now);
        self.auth_retry_count += 1;
        tracing::warn!(
            attempt = self.auth_retry_count,
            max = MAX_AUTH_ATTEMPTS,
            "authentication attempt failed"
        );
    }

    pub fn auth_retry_count(&self) -> u32 {
        self.auth_retry_count
    }
}

// ── Token expiry extraction ──────────────────────────────────────────

/// Extract the expiry timestamp from a signed token.
///
/// A token with exactly three dot-separated segments is treated as
/// signed: the middle segment is base64url-decoded and its numeric `exp`
/// claim read. Any malformed segment, padding, or non-numeric claim
/// yields `None` rather than an error -- callers treat unknown expiry as
/// "expiring now" only at expiry-check time.
pub fn extract_token_expiry(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        tracing::debug!("token is not a three-segment signed token, no expiry available");
        return None;
    };

    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    let exp = claims.get("exp")?.as_f64()?;

    #[allow(clippy::cast_possible_truncation)]
    Some(exp as i64)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_exp(exp: &str) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{exp}}}"));
        format!("hdr.{payload}.sig")
    }

    #[test]
    fn extracts_numeric_expiry() {
        assert_eq!(extract_token_expiry(&token_with_exp("1735689600")), Some(1_735_689_600));
    }

    #[test]
    fn extracts_float_expiry() {
        assert_eq!(extract_token_expiry(&token_with_exp("1735689600.5")), Some(1_735_689_600));
    }

    #[test]
    fn wrong_segment_count_yields_none() {
        assert_eq!(extract_token_expiry("opaque-token"), None);
        assert_eq!(extract_token_expiry("a.b"), None);
        assert_eq!(extract_token_expiry("a.b.c.d"), None);
    }

    #[test]
    fn bad_base64_yields_none() {
        assert_eq!(extract_token_expiry("hdr.!!!not-base64!!!.sig"), None);
    }

    #[test]
    fn non_numeric_claim_yields_none() {
        assert_eq!(extract_token_expiry(&token_with_exp("\"soon\"")), None);
    }

    #[test]
    fn missing_claim_yields_none() {
        let payload = URL_SAFE_NO_PAD.encode("{\"sub\":\"user\"}");
        assert_eq!(extract_token_expiry(&format!("hdr.{payload}.sig")), None);
    }

    #[test]
    fn padded_payload_decodes() {
        // A payload whose encoder emitted padding still decodes.
        let padded = base64::engine::general_purpose::URL_SAFE.encode("{\"exp\":1700000000}");
        assert_eq!(
            extract_token_expiry(&format!("hdr.{padded}.sig")),
            Some(1_700_000_000)
        );
    }

    // ── Freshness ────────────────────────────────────────────────────

    fn session_with_token(expires_at: i64) -> Session {
        let mut s = Session::new(DEFAULT_EXPIRY_BUFFER_SECS);
        s.adopt_tokens(token_with_exp(&expires_at.to_string()), None);
        s
    }

    #[test]
    fn token_outside_buffer_is_fresh() {
        let s = session_with_token(1000 + 301);
        assert!(s.token_is_fresh(1000));
    }

    #[test]
    fn token_inside_buffer_is_expiring() {
        let s = session_with_token(1000 + 299);
        assert!(!s.token_is_fresh(1000));
    }

    #[test]
    fn token_without_expiry_counts_as_expiring() {
        let mut s = Session::new(DEFAULT_EXPIRY_BUFFER_SECS);
        s.adopt_tokens("opaque-token".into(), None);
        assert!(!s.token_is_fresh(0));
    }

    // ── Backoff ladder ───────────────────────────────────────────────

    #[test]
    fn first_attempt_is_allowed() {
        let mut s = Session::new(DEFAULT_EXPIRY_BUFFER_SECS);
        assert_eq!(s.auth_gate(1000), AuthGate::Allowed);
    }

    #[test]
    fn backoff_delays_increase_per_attempt() {
        let mut s = Session::new(DEFAULT_EXPIRY_BUFFER_SECS);

        s.record_auth_failure(1000);
        assert!(matches!(s.auth_gate(1010), AuthGate::Backoff { .. }));
        assert_eq!(s.auth_gate(1030), AuthGate::Allowed);

        s.record_auth_failure(2000);
        assert!(matches!(s.auth_gate(2060), AuthGate::Backoff { .. }));
        assert_eq!(s.auth_gate(2120), AuthGate::Allowed);

        s.record_auth_failure(3000);
        assert!(matches!(s.auth_gate(3200), AuthGate::Backoff { .. }));
        // Third failure hits the attempt limit: 300s delay no longer
        // applies, the 30-minute lockout does.
        assert!(matches!(s.auth_gate(3300), AuthGate::Backoff { .. }));
    }

    #[test]
    fn lockout_rejects_within_thirty_minutes_then_resets() {
        let mut s = Session::new(DEFAULT_EXPIRY_BUFFER_SECS);
        for i in 0..3 {
            s.record_auth_failure(1000 + i);
        }

        // A 4th attempt inside the window is rejected locally.
        assert!(matches!(s.auth_gate(1002 + 1799), AuthGate::Backoff { .. }));
        // 30 minutes and 1 second after the last failure: allowed again,
        // counters reset.
        assert_eq!(s.auth_gate(1002 + 1801), AuthGate::Allowed);
        assert_eq!(s.auth_retry_count(), 0);
    }

    #[test]
    fn adopting_tokens_resets_backoff_and_pending_mfa() {
        let mut s = Session::new(DEFAULT_EXPIRY_BUFFER_SECS);
        s.record_auth_failure(1000);
        s.set_pending_mfa("mfa-tok".into());

        let rotated = s.adopt_tokens(token_with_exp("2000000000"), Some("r2".into()));
        assert_eq!(rotated.as_deref(), Some("r2"));
        assert!(!s.is_mfa_pending());
        assert_eq!(s.auth_retry_count(), 0);
        assert_eq!(s.auth_gate(1001), AuthGate::Allowed);
    }

    #[test]
    fn pending_mfa_drops_access_token() {
        let mut s = session_with_token(2_000_000_000);
        s.set_pending_mfa("mfa-tok".into());
        assert!(s.bearer_token().is_none());
        assert!(s.is_mfa_pending());
    }

    #[test]
    fn clear_auth_data_keeps_stored_credentials() {
        let mut s = session_with_token(2_000_000_000);
        s.store_credentials("a@b.com", SecretString::from("pw".to_owned()));
        s.clear_auth_data();
        assert!(s.bearer_token().is_none());
        assert!(s.refresh_token().is_none());
        assert!(s.has_stored_credentials());
    }
}
