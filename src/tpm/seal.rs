//! Sealing data under a PCR + password policy, and getting it back.
//!
//! Both directions build the policy the same way: an optional PolicyPCR over
//! the current PCR values followed by PolicyPassword. Sealing stores the
//! resulting digest in the new object; unsealing rebuilds it in a live
//! session, and the TPM releases the data only if the two match and the
//! password is right.

use super::pcr::{HashAlg, PcrSelection};
use super::session::{with_policy_session, AuthSession};
use super::{
    Digest, Handle, ObjectRole, Password, PublicTemplate, SealedObject, Tpm, MAX_SEALED_DATA,
};
use crate::blob::BlobSink;
use crate::error::{Error, Errors, Result};

/// Hash of the policy sessions and of the sealed object's name.
const POLICY_HASH: HashAlg = HashAlg::Sha256;

/// Data small enough to be sealed.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > MAX_SEALED_DATA {
            return Err(Error::input(
                "data",
                format!("exceeds {MAX_SEALED_DATA} bytes"),
            ));
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(data: &str) -> Result<Self> {
        let bytes = hex::decode(data.trim()).map_err(|e| Error::input("data", e))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

/// PolicyPCR (when a selection is given) then PolicyPassword.
fn apply_policy<T: Tpm + ?Sized>(
    tpm: &mut T,
    session: &mut AuthSession,
    pcrs: Option<&PcrSelection>,
) -> Result<()> {
    if let Some(selection) = pcrs {
        session.policy_pcr(tpm, &Digest::empty(), selection)?;
    }
    session.policy_password(tpm)
}

/// Seals `payload` under `parent`. The session used to compute the policy is
/// flushed before this returns; every failure is pushed onto `errors`.
pub fn seal_object<T: Tpm + ?Sized>(
    tpm: &mut T,
    errors: &mut Errors,
    parent: Handle,
    parent_auth: &Password,
    object_password: &Password,
    payload: &Payload,
    pcrs: Option<&PcrSelection>,
) -> Option<SealedObject> {
    log::debug!(
        "sealing {} bytes under {parent}, PCR binding {}",
        payload.len(),
        pcrs.map_or_else(|| "none".to_string(), ToString::to_string),
    );
    with_policy_session(tpm, POLICY_HASH, errors, |tpm, session| {
        apply_policy(tpm, session, pcrs)?;
        let policy = session.policy_get_digest(tpm)?;
        let template = PublicTemplate::sealed_data(policy);
        template
            .validate(ObjectRole::SealedData)
            .map_err(|e| Error::input("template", e))?;
        tpm.create(
            parent,
            parent_auth,
            &template,
            object_password,
            payload.as_bytes(),
        )
        .map_err(|e| e.context("unable to seal data"))
    })
}

/// [`seal_object`], then writes the private half followed by the public half.
///
/// The two writes are independent; each failure names its own location.
/// Returns whether both blobs were written.
#[allow(clippy::too_many_arguments)]
pub fn seal<T: Tpm + ?Sized>(
    tpm: &mut T,
    errors: &mut Errors,
    parent: Handle,
    parent_auth: &Password,
    object_password: &Password,
    payload: &Payload,
    pcrs: Option<&PcrSelection>,
    private_sink: &mut dyn BlobSink,
    public_sink: &mut dyn BlobSink,
) -> bool {
    let Some(sealed) = seal_object(
        tpm,
        errors,
        parent,
        parent_auth,
        object_password,
        payload,
        pcrs,
    ) else {
        return false;
    };
    if errors.collect(private_sink.store(sealed.private.as_bytes())).is_none() {
        return false;
    }
    if errors.collect(public_sink.store(sealed.public.as_bytes())).is_none() {
        return false;
    }
    log::info!(
        "sealed data to {} and {}",
        private_sink.location(),
        public_sink.location()
    );
    true
}

/// Rebuilds the seal-time policy in a fresh session and unseals `object`.
///
/// Any mismatch (PCR drift, wrong password, different selection) is an
/// [`Error::Authorization`]; nothing is returned in that case.
pub fn unseal_object<T: Tpm + ?Sized>(
    tpm: &mut T,
    errors: &mut Errors,
    object: Handle,
    object_password: &Password,
    pcrs: Option<&PcrSelection>,
) -> Option<Vec<u8>> {
    log::debug!("unsealing {object}");
    with_policy_session(tpm, POLICY_HASH, errors, |tpm, session| {
        apply_policy(tpm, session, pcrs)?;
        let session = session.consume()?;
        tpm.unseal(session, object, object_password)
            .map_err(|e| e.context("unable to unseal data"))
    })
}

/// [`unseal_object`], then writes the plaintext to `sink`.
pub fn unseal<T: Tpm + ?Sized>(
    tpm: &mut T,
    errors: &mut Errors,
    object: Handle,
    object_password: &Password,
    pcrs: Option<&PcrSelection>,
    sink: &mut dyn BlobSink,
) -> bool {
    let Some(data) = unseal_object(tpm, errors, object, object_password, pcrs) else {
        return false;
    };
    if errors.collect(sink.store(&data)).is_none() {
        return false;
    }
    log::info!("unsealed {} bytes to {}", data.len(), sink.location());
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobSource, MemoryBlob};
    use crate::tpm::mock::{Command, MockTpm};
    use crate::tpm::object::{create_primary, load, srk_template};
    use crate::tpm::Hierarchy;
    use eyre::{eyre, Result};

    struct BrokenSink;

    impl BlobSink for BrokenSink {
        fn location(&self) -> String {
            "broken".into()
        }

        fn store(&mut self, _bytes: &[u8]) -> crate::error::Result<()> {
            Err(Error::Storage {
                context: "couldn't write to file".into(),
                path: "broken".into(),
                reason: "disk full".into(),
            })
        }
    }

    fn pcr7() -> Option<PcrSelection> {
        PcrSelection::single(HashAlg::Sha256, 7).ok()
    }

    /// Creates an SRK, seals `data` under it and loads the result.
    fn sealed(
        tpm: &mut MockTpm,
        data: &[u8],
        password: &str,
        pcrs: Option<&PcrSelection>,
    ) -> Result<Handle> {
        let srk = create_primary(tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
        let mut errors = Errors::new();
        let object = seal_object(
            tpm,
            &mut errors,
            srk,
            &Password::empty(),
            &Password::from(password),
            &Payload::new(data.to_vec())?,
            pcrs,
        )
        .ok_or_else(|| eyre!("seal failed: {:?}", errors))?;
        Ok(load(tpm, srk, &Password::empty(), &object.public, &object.private)?)
    }

    #[test]
    fn payload_size_boundary() {
        assert!(Payload::new(vec![0xaa; 128]).is_ok());
        let err = Payload::new(vec![0xaa; 129]).unwrap_err();
        assert!(err.is_input());
        assert_eq!(err.to_string(), "invalid flag 'data': exceeds 128 bytes");
    }

    #[test]
    fn payload_hex() -> Result<()> {
        assert_eq!(Payload::from_hex("00ff10")?.as_bytes(), &[0x00, 0xff, 0x10]);
        assert!(Payload::from_hex("")?.is_empty());
        assert!(Payload::from_hex("abc").unwrap_err().is_input());
        assert!(Payload::from_hex("zz").unwrap_err().is_input());
        Ok(())
    }

    #[test]
    fn round_trip_with_and_without_pcr() -> Result<()> {
        let payloads: [&[u8]; 3] = [b"", b"howdy", &[0x5a; 128]];
        for pcrs in [None, pcr7()] {
            for data in payloads {
                let mut tpm = MockTpm::new();
                let object = sealed(&mut tpm, data, "secret", pcrs.as_ref())?;
                let mut errors = Errors::new();
                let out = unseal_object(
                    &mut tpm,
                    &mut errors,
                    object,
                    &Password::from("secret"),
                    pcrs.as_ref(),
                );
                assert!(errors.is_empty(), "{errors:?}");
                assert_eq!(out.as_deref(), Some(data));
                assert_eq!(tpm.session_count(), 0);
            }
        }
        Ok(())
    }

    #[test]
    fn pcr_drift_is_an_authorization_error() -> Result<()> {
        let mut tpm = MockTpm::new();
        let object = sealed(&mut tpm, b"boot secret", "pw", pcr7().as_ref())?;
        tpm.extend_pcr(7, b"something booted")?;

        let mut errors = Errors::new();
        let out = unseal_object(&mut tpm, &mut errors, object, &Password::from("pw"), pcr7().as_ref());
        assert_eq!(out, None);
        assert_eq!(errors.len(), 1);
        assert!(errors.iter().all(Error::is_authorization));
        assert_eq!(tpm.session_count(), 0);
        Ok(())
    }

    #[test]
    fn unrelated_pcr_change_does_not_matter() -> Result<()> {
        let mut tpm = MockTpm::new();
        let object = sealed(&mut tpm, b"boot secret", "pw", pcr7().as_ref())?;
        tpm.extend_pcr(8, b"unrelated")?;
        let mut errors = Errors::new();
        let out = unseal_object(&mut tpm, &mut errors, object, &Password::from("pw"), pcr7().as_ref());
        assert_eq!(out.as_deref(), Some(&b"boot secret"[..]));
        Ok(())
    }

    #[test]
    fn wrong_password_is_an_authorization_error() -> Result<()> {
        for pcrs in [None, pcr7()] {
            let mut tpm = MockTpm::new();
            let object = sealed(&mut tpm, b"data", "right", pcrs.as_ref())?;
            let mut errors = Errors::new();
            let out = unseal_object(
                &mut tpm,
                &mut errors,
                object,
                &Password::from("wrong"),
                pcrs.as_ref(),
            );
            assert_eq!(out, None);
            assert!(errors.iter().all(Error::is_authorization));
            assert_eq!(errors.len(), 1);
        }
        Ok(())
    }

    #[test]
    fn different_selection_is_an_authorization_error() -> Result<()> {
        let mut tpm = MockTpm::new();
        let object = sealed(&mut tpm, b"data", "pw", pcr7().as_ref())?;
        let mut errors = Errors::new();
        assert_eq!(
            unseal_object(&mut tpm, &mut errors, object, &Password::from("pw"), None),
            None
        );
        let other = PcrSelection::single(HashAlg::Sha256, 0)?;
        assert_eq!(
            unseal_object(&mut tpm, &mut errors, object, &Password::from("pw"), Some(&other)),
            None
        );
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(Error::is_authorization));
        Ok(())
    }

    #[test]
    fn seal_writes_both_blobs() -> Result<()> {
        let mut tpm = MockTpm::new();
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
        let mut private = MemoryBlob::new("private");
        let mut public = MemoryBlob::new("public");
        let mut errors = Errors::new();
        assert!(seal(
            &mut tpm,
            &mut errors,
            srk,
            &Password::empty(),
            &Password::from("pw"),
            &Payload::from_hex("c0ffee")?,
            None,
            &mut private,
            &mut public,
        ));
        assert!(errors.is_empty());

        let object = load(
            &mut tpm,
            srk,
            &Password::empty(),
            &crate::tpm::PublicBlob::new(public.fetch()?),
            &crate::tpm::PrivateBlob::new(private.fetch()?),
        )?;
        let mut plain = MemoryBlob::new("plain");
        assert!(unseal(
            &mut tpm,
            &mut errors,
            object,
            &Password::from("pw"),
            None,
            &mut plain
        ));
        assert_eq!(plain.bytes(), Some(&[0xc0, 0xff, 0xee][..]));
        Ok(())
    }

    #[test]
    fn second_blob_failure_is_reported_on_its_own() -> Result<()> {
        let mut tpm = MockTpm::new();
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
        let mut private = MemoryBlob::new("private");
        let mut errors = Errors::new();
        assert!(!seal(
            &mut tpm,
            &mut errors,
            srk,
            &Password::empty(),
            &Password::empty(),
            &Payload::from_hex("01")?,
            None,
            &mut private,
            &mut BrokenSink,
        ));
        assert!(private.bytes().is_some());
        let errors = errors.into_inner();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_storage());
        assert!(errors[0].to_string().contains("broken"));
        Ok(())
    }

    #[test]
    fn first_blob_failure_skips_the_second() -> Result<()> {
        let mut tpm = MockTpm::new();
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
        let mut public = MemoryBlob::new("public");
        let mut errors = Errors::new();
        assert!(!seal(
            &mut tpm,
            &mut errors,
            srk,
            &Password::empty(),
            &Password::empty(),
            &Payload::from_hex("01")?,
            None,
            &mut BrokenSink,
            &mut public,
        ));
        assert!(public.bytes().is_none());
        let errors = errors.into_inner();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_storage());
        assert!(errors[0].to_string().contains("broken"));
        assert!(!errors[0].to_string().contains("public"));
        Ok(())
    }

    #[test]
    fn device_failure_midway_still_flushes() -> Result<()> {
        for failing in [
            Command::PolicyPcr,
            Command::PolicyPassword,
            Command::PolicyGetDigest,
            Command::Create,
        ] {
            let mut tpm = MockTpm::new();
            let srk = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
            tpm.fail_on(failing);
            let mut errors = Errors::new();
            let out = seal_object(
                &mut tpm,
                &mut errors,
                srk,
                &Password::empty(),
                &Password::empty(),
                &Payload::from_hex("42")?,
                pcr7().as_ref(),
            );
            assert!(out.is_none());
            assert_eq!(errors.len(), 1, "{failing:?}");
            assert!(errors.iter().all(Error::is_device));
            assert_eq!(tpm.session_count(), 0, "{failing:?} leaked a session");
            assert_eq!(tpm.transient_count(), 1);
        }
        Ok(())
    }

    #[test]
    fn wrong_parent_auth_does_not_leak_the_session() -> Result<()> {
        let mut tpm = MockTpm::new();
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
        let mut errors = Errors::new();
        let out = seal_object(
            &mut tpm,
            &mut errors,
            srk,
            &Password::from("not the srk password"),
            &Password::empty(),
            &Payload::from_hex("42")?,
            None,
        );
        assert!(out.is_none());
        assert!(errors.iter().all(Error::is_authorization));
        assert_eq!(tpm.session_count(), 0);
        Ok(())
    }

    #[test]
    fn unseal_of_missing_object_is_a_device_error() {
        let mut tpm = MockTpm::new();
        let mut errors = Errors::new();
        let out = unseal_object(
            &mut tpm,
            &mut errors,
            Handle::new(0x8000_0042),
            &Password::empty(),
            None,
        );
        assert!(out.is_none());
        assert!(errors.iter().all(Error::is_device));
        assert_eq!(tpm.session_count(), 0);
    }
}
