//! Policy sessions: start, accumulate assertions, read the digest, flush.
//!
//! A session moves through `Started -> Asserting* -> Consumed` while it is
//! alive and is flushed exactly once when [`AuthSession::flush`] takes it by
//! value. [`with_policy_session`] wraps that lifecycle so the flush happens on
//! every path and its failure lands in the caller's [`Errors`].

use super::pcr::{HashAlg, PcrSelection};
use super::{Digest, Handle, SessionType, StartAuthSession, Tpm};
use crate::error::{Error, Errors, Result};

/// How the session key is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBinding {
    /// No tpmKey and no bindKey. The session key is not secret, so all the
    /// protection comes from the policy assertions.
    Unbound,
    Bound { tpm_key: Handle, bind_key: Handle },
}

impl SessionBinding {
    fn of(params: &StartAuthSession) -> Self {
        if params.tpm_key == Handle::NULL && params.bind_key == Handle::NULL {
            SessionBinding::Unbound
        } else {
            SessionBinding::Bound {
                tpm_key: params.tpm_key,
                bind_key: params.bind_key,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Started,
    Asserting,
    Consumed,
}

/// Parameters for an unbound, unsalted policy session without parameter
/// encryption.
pub fn unbound_policy(hash: HashAlg) -> StartAuthSession {
    StartAuthSession {
        tpm_key: Handle::NULL,
        bind_key: Handle::NULL,
        nonce_caller: vec![0; 16],
        secret: Vec::new(),
        session_type: SessionType::Policy,
        symmetric: None,
        auth_hash: hash,
    }
}

#[derive(Debug)]
pub struct AuthSession {
    handle: Handle,
    binding: SessionBinding,
    hash: HashAlg,
    state: SessionState,
    pcr_selections: Vec<PcrSelection>,
    password_required: bool,
    flushed: bool,
}

impl AuthSession {
    pub fn start<T: Tpm + ?Sized>(tpm: &mut T, params: &StartAuthSession) -> Result<Self> {
        let binding = SessionBinding::of(params);
        let handle = tpm
            .start_auth_session(params)
            .map_err(|e| e.context("unable to start session"))?;
        if binding == SessionBinding::Unbound {
            log::warn!(
                "policy session {handle} is not bound to any key; \
                 only its policy assertions protect it"
            );
        }
        log::debug!("started {:?} session {handle}", params.session_type);
        Ok(Self {
            handle,
            binding,
            hash: params.auth_hash,
            state: SessionState::Started,
            pcr_selections: Vec::new(),
            password_required: false,
            flushed: false,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn binding(&self) -> SessionBinding {
        self.binding
    }

    pub fn hash(&self) -> HashAlg {
        self.hash
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn password_required(&self) -> bool {
        self.password_required
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            SessionState::Consumed => Err(Error::input(
                "session",
                format!("session {} was already consumed", self.handle),
            )),
            _ => Ok(()),
        }
    }

    /// Requires the selected PCRs to hold `expected` (or, when `expected` is
    /// empty, whatever they hold now) at the time the session is used.
    pub fn policy_pcr<T: Tpm + ?Sized>(
        &mut self,
        tpm: &mut T,
        expected: &Digest,
        selection: &PcrSelection,
    ) -> Result<()> {
        self.ensure_live()?;
        if self.pcr_selections.contains(selection) {
            return Err(Error::input(
                "pcr",
                format!("{selection} is already asserted on session {}", self.handle),
            ));
        }
        tpm.policy_pcr(self.handle, expected, selection)
            .map_err(|e| e.context("unable to bind PCRs to auth policy"))?;
        log::debug!("session {}: PolicyPCR {selection}", self.handle);
        self.pcr_selections.push(selection.clone());
        self.state = SessionState::Asserting;
        Ok(())
    }

    /// Requires the object password in cleartext when the session is used.
    pub fn policy_password<T: Tpm + ?Sized>(&mut self, tpm: &mut T) -> Result<()> {
        self.ensure_live()?;
        tpm.policy_password(self.handle)
            .map_err(|e| e.context("unable to require password for auth policy"))?;
        log::debug!("session {}: PolicyPassword", self.handle);
        self.password_required = true;
        self.state = SessionState::Asserting;
        Ok(())
    }

    pub fn policy_get_digest<T: Tpm + ?Sized>(&self, tpm: &mut T) -> Result<Digest> {
        self.ensure_live()?;
        let digest = tpm
            .policy_get_digest(self.handle)
            .map_err(|e| e.context("unable to get policy digest"))?;
        log::debug!("session {}: policy digest {digest}", self.handle);
        Ok(digest)
    }

    /// Hands the session out as the authorization of one command.
    pub fn consume(&mut self) -> Result<Handle> {
        self.ensure_live()?;
        self.state = SessionState::Consumed;
        Ok(self.handle)
    }

    pub fn flush<T: Tpm + ?Sized>(mut self, tpm: &mut T) -> Result<()> {
        self.flushed = true;
        tpm.flush_context(self.handle)
            .map_err(|e| e.context("unable to flush session"))?;
        log::debug!("flushed session {}", self.handle);
        Ok(())
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        if !self.flushed {
            log::error!("session {} dropped without being flushed", self.handle);
        }
    }
}

/// Runs `f` with a fresh unbound policy session and flushes the session
/// afterwards, whatever `f` returned.
///
/// Errors are recorded in `errors`: first the one from `f`, then a failed
/// flush. Returns the value of `f` only when it succeeded.
pub fn with_policy_session<T, R, F>(
    tpm: &mut T,
    hash: HashAlg,
    errors: &mut Errors,
    f: F,
) -> Option<R>
where
    T: Tpm + ?Sized,
    F: FnOnce(&mut T, &mut AuthSession) -> Result<R>,
{
    let mut session = errors.collect(AuthSession::start(tpm, &unbound_policy(hash)))?;
    let result = f(tpm, &mut session);
    let flushed = session.flush(tpm);
    let value = errors.collect(result);
    errors.collect(flushed);
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::mock::{Command, MockTpm};
    use eyre::Result;
    use sha2::{Digest as _, Sha256};

    const TPM_CC_POLICY_AUTH_VALUE: u32 = 0x0000_016b;

    #[test]
    fn unbound_params() {
        let params = unbound_policy(HashAlg::Sha256);
        assert_eq!(SessionBinding::of(&params), SessionBinding::Unbound);
        assert_eq!(params.nonce_caller, vec![0; 16]);
        assert_eq!(params.session_type, SessionType::Policy);
        assert!(params.symmetric.is_none());
    }

    #[test]
    fn fresh_session_has_zero_digest() -> Result<()> {
        let mut tpm = MockTpm::new();
        let session = AuthSession::start(&mut tpm, &unbound_policy(HashAlg::Sha256))?;
        assert_eq!(session.binding(), SessionBinding::Unbound);
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.policy_get_digest(&mut tpm)?, Digest::new(vec![0; 32]));
        session.flush(&mut tpm)?;
        assert_eq!(tpm.session_count(), 0);
        Ok(())
    }

    #[test]
    fn policy_password_extends_with_auth_value_marker() -> Result<()> {
        let mut tpm = MockTpm::new();
        let mut session = AuthSession::start(&mut tpm, &unbound_policy(HashAlg::Sha256))?;
        session.policy_password(&mut tpm)?;
        assert!(session.password_required());
        assert_eq!(session.state(), SessionState::Asserting);

        let mut expected = Sha256::new();
        expected.update([0u8; 32]);
        expected.update(TPM_CC_POLICY_AUTH_VALUE.to_be_bytes());
        assert_eq!(
            session.policy_get_digest(&mut tpm)?,
            Digest::new(expected.finalize().to_vec())
        );
        session.flush(&mut tpm)?;
        Ok(())
    }

    #[test]
    fn digest_depends_on_assertion_order() -> Result<()> {
        let mut tpm = MockTpm::new();
        let selection = PcrSelection::single(HashAlg::Sha256, 7)?;

        let mut first = AuthSession::start(&mut tpm, &unbound_policy(HashAlg::Sha256))?;
        first.policy_pcr(&mut tpm, &Digest::empty(), &selection)?;
        first.policy_password(&mut tpm)?;
        let pcr_then_password = first.policy_get_digest(&mut tpm)?;
        first.flush(&mut tpm)?;

        let mut second = AuthSession::start(&mut tpm, &unbound_policy(HashAlg::Sha256))?;
        second.policy_password(&mut tpm)?;
        second.policy_pcr(&mut tpm, &Digest::empty(), &selection)?;
        let password_then_pcr = second.policy_get_digest(&mut tpm)?;
        second.flush(&mut tpm)?;

        assert_ne!(pcr_then_password, password_then_pcr);
        Ok(())
    }

    #[test]
    fn same_selection_twice_is_rejected_locally() -> Result<()> {
        let mut tpm = MockTpm::new();
        let selection = PcrSelection::single(HashAlg::Sha256, 3)?;
        let mut session = AuthSession::start(&mut tpm, &unbound_policy(HashAlg::Sha256))?;
        session.policy_pcr(&mut tpm, &Digest::empty(), &selection)?;
        let before = tpm.command_count();
        assert!(session
            .policy_pcr(&mut tpm, &Digest::empty(), &selection)
            .unwrap_err()
            .is_input());
        assert_eq!(tpm.command_count(), before);
        session.flush(&mut tpm)?;
        Ok(())
    }

    #[test]
    fn consumed_session_refuses_more_assertions() -> Result<()> {
        let mut tpm = MockTpm::new();
        let mut session = AuthSession::start(&mut tpm, &unbound_policy(HashAlg::Sha256))?;
        let handle = session.consume()?;
        assert_eq!(handle, session.handle());
        assert_eq!(session.state(), SessionState::Consumed);
        assert!(session.policy_password(&mut tpm).is_err());
        assert!(session.consume().is_err());
        session.flush(&mut tpm)?;
        Ok(())
    }

    #[test]
    fn scoped_session_is_flushed_on_success() -> Result<()> {
        let mut tpm = MockTpm::new();
        let mut errors = Errors::new();
        let digest = with_policy_session(&mut tpm, HashAlg::Sha256, &mut errors, |tpm, s| {
            s.policy_password(tpm)?;
            s.policy_get_digest(tpm)
        });
        assert!(digest.is_some());
        assert!(errors.is_empty());
        assert_eq!(tpm.session_count(), 0);
        Ok(())
    }

    #[test]
    fn scoped_session_is_flushed_on_failure() {
        let mut tpm = MockTpm::new();
        tpm.fail_on(Command::PolicyPassword);
        let mut errors = Errors::new();
        let digest = with_policy_session(&mut tpm, HashAlg::Sha256, &mut errors, |tpm, s| {
            s.policy_password(tpm)?;
            s.policy_get_digest(tpm)
        });
        assert!(digest.is_none());
        assert_eq!(errors.len(), 1);
        assert_eq!(tpm.session_count(), 0);
    }

    #[test]
    fn flush_failure_is_reported_after_primary_failure() {
        let mut tpm = MockTpm::new();
        tpm.fail_on(Command::PolicyPassword);
        tpm.fail_on(Command::FlushContext);
        let mut errors = Errors::new();
        let out = with_policy_session(&mut tpm, HashAlg::Sha256, &mut errors, |tpm, s| {
            s.policy_password(tpm)
        });
        assert!(out.is_none());
        let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("unable to require password for auth policy"));
        assert!(messages[1].starts_with("unable to flush session"));
    }

    #[test]
    fn session_exhaustion_is_a_device_error() {
        let mut tpm = MockTpm::new().with_max_sessions(0);
        let mut errors = Errors::new();
        let out = with_policy_session(&mut tpm, HashAlg::Sha256, &mut errors, |_, _| Ok(()));
        assert!(out.is_none());
        assert!(errors.iter().all(Error::is_device));
        assert_eq!(errors.len(), 1);
    }
}
