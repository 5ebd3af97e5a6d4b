use crate::error::{Error, Result};
use ambassador::{delegatable_trait, Delegate};
use bitflags::bitflags;
use pcr::{HashAlg, PcrSelection};
use std::fmt;
use thiserror::Error;

#[cfg(feature = "esapi")]
pub mod esapi;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod object;
pub mod pcr;
pub mod seal;
pub mod session;

/// Largest payload a sealed data object can carry.
pub const MAX_SEALED_DATA: usize = 128;

/// 32-bit name of an object or session resident in the TPM.
///
/// Printed and parsed as lowercase hexadecimal without a `0x` prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u32);

impl Handle {
    pub const OWNER: Handle = Handle(0x4000_0001);
    pub const NULL: Handle = Handle(0x4000_0007);
    pub const ENDORSEMENT: Handle = Handle(0x4000_000b);
    pub const PLATFORM: Handle = Handle(0x4000_000c);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    fn kind(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn is_transient(self) -> bool {
        self.kind() == 0x80
    }

    pub fn is_persistent(self) -> bool {
        self.kind() == 0x81
    }

    pub fn is_session(self) -> bool {
        matches!(self.kind(), 0x02 | 0x03)
    }

    /// Parses a handle flag. Empty values are reported as missing.
    pub fn parse_flag(flag: &str, value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::input(flag, "missing value"));
        }
        let digits = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .unwrap_or(value);
        u32::from_str_radix(digits, 16)
            .map(Handle)
            .map_err(|e| Error::input(flag, e))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl From<Handle> for u32 {
    fn from(handle: Handle) -> Self {
        handle.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    Owner,
    Platform,
    Endorsement,
    Null,
}

impl Hierarchy {
    pub fn handle(self) -> Handle {
        match self {
            Hierarchy::Owner => Handle::OWNER,
            Hierarchy::Platform => Handle::PLATFORM,
            Hierarchy::Endorsement => Handle::ENDORSEMENT,
            Hierarchy::Null => Handle::NULL,
        }
    }
}

/// Cleartext authorization value. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Password(Vec<u8>);

impl Password {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(..)")
    }
}

/// A hash value, typically a policy digest.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

bitflags! {
    /// TPMA_OBJECT bits used by the templates in this crate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjectAttributes: u32 {
        const FIXED_TPM = 1 << 1;
        const FIXED_PARENT = 1 << 4;
        const SENSITIVE_DATA_ORIGIN = 1 << 5;
        const USER_WITH_AUTH = 1 << 6;
        const NO_DA = 1 << 10;
        const RESTRICTED = 1 << 16;
        const DECRYPT = 1 << 17;
        const SIGN_ENCRYPT = 1 << 18;
    }
}

/// AES in CFB mode, the only symmetric scheme the templates use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AesCfb {
    pub key_bits: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectParams {
    Rsa {
        key_bits: u16,
        exponent: u32,
        symmetric: Option<AesCfb>,
    },
    KeyedHash,
}

/// What a template is meant to create; decides which attributes are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRole {
    StorageRoot,
    SealedData,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("storage root template is missing {0:?}")]
    MissingAttributes(ObjectAttributes),
    #[error("sealed data template must not carry {0:?}")]
    ForbiddenAttributes(ObjectAttributes),
    #[error("storage root must be an RSA key with a symmetric scheme")]
    NotAStorageKey,
    #[error("sealed data must be a keyed hash object")]
    NotSealedData,
}

/// Description of an object to be created.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicTemplate {
    pub params: ObjectParams,
    pub name_alg: HashAlg,
    pub attributes: ObjectAttributes,
    pub auth_policy: Digest,
}

impl PublicTemplate {
    /// Keyed hash object holding caller supplied data, gated by `policy`.
    pub fn sealed_data(policy: Digest) -> Self {
        Self {
            params: ObjectParams::KeyedHash,
            name_alg: HashAlg::Sha256,
            attributes: ObjectAttributes::FIXED_TPM | ObjectAttributes::FIXED_PARENT,
            auth_policy: policy,
        }
    }

    pub fn validate(&self, role: ObjectRole) -> core::result::Result<(), TemplateError> {
        match role {
            ObjectRole::StorageRoot => {
                let required = ObjectAttributes::RESTRICTED
                    | ObjectAttributes::DECRYPT
                    | ObjectAttributes::FIXED_TPM
                    | ObjectAttributes::FIXED_PARENT;
                if !self.attributes.contains(required) {
                    return Err(TemplateError::MissingAttributes(
                        required.difference(self.attributes),
                    ));
                }
                match self.params {
                    ObjectParams::Rsa {
                        symmetric: Some(_), ..
                    } => Ok(()),
                    _ => Err(TemplateError::NotAStorageKey),
                }
            }
            ObjectRole::SealedData => {
                let forbidden = ObjectAttributes::RESTRICTED
                    | ObjectAttributes::DECRYPT
                    | ObjectAttributes::SIGN_ENCRYPT
                    | ObjectAttributes::SENSITIVE_DATA_ORIGIN;
                if self.attributes.intersects(forbidden) {
                    return Err(TemplateError::ForbiddenAttributes(
                        self.attributes.intersection(forbidden),
                    ));
                }
                match self.params {
                    ObjectParams::KeyedHash => Ok(()),
                    _ => Err(TemplateError::NotSealedData),
                }
            }
        }
    }
}

/// Encrypted sensitive portion of an object, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateBlob(Vec<u8>);

/// Public portion of an object, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicBlob(Vec<u8>);

impl PrivateBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl PublicBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Output of a seal: both halves of a not yet loaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedObject {
    pub public: PublicBlob,
    pub private: PrivateBlob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Hmac,
    Policy,
    Trial,
}

/// Parameters of TPM2_StartAuthSession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartAuthSession {
    pub tpm_key: Handle,
    pub bind_key: Handle,
    pub nonce_caller: Vec<u8>,
    pub secret: Vec<u8>,
    pub session_type: SessionType,
    pub symmetric: Option<AesCfb>,
    pub auth_hash: HashAlg,
}

/// Commands this crate issues to a TPM.
///
/// Implementations map device return codes onto [`Error::Device`] and
/// [`Error::Authorization`].
#[delegatable_trait]
pub trait Tpm {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        hierarchy_auth: &Password,
        template: &PublicTemplate,
    ) -> Result<Handle>;

    /// TPM2_Create with caller supplied sensitive data.
    fn create(
        &mut self,
        parent: Handle,
        parent_auth: &Password,
        template: &PublicTemplate,
        object_auth: &Password,
        data: &[u8],
    ) -> Result<SealedObject>;

    fn load(
        &mut self,
        parent: Handle,
        parent_auth: &Password,
        public: &PublicBlob,
        private: &PrivateBlob,
    ) -> Result<Handle>;

    fn evict_control(
        &mut self,
        hierarchy: Hierarchy,
        auth: &Password,
        object: Handle,
        persistent: Handle,
    ) -> Result<()>;

    fn flush_context(&mut self, handle: Handle) -> Result<()>;

    fn start_auth_session(&mut self, params: &StartAuthSession) -> Result<Handle>;

    fn policy_pcr(
        &mut self,
        session: Handle,
        expected: &Digest,
        selection: &PcrSelection,
    ) -> Result<()>;

    fn policy_password(&mut self, session: Handle) -> Result<()>;

    fn policy_get_digest(&mut self, session: Handle) -> Result<Digest>;

    /// TPM2_Unseal authorized by `session`, presenting `object_auth`.
    fn unseal(&mut self, session: Handle, object: Handle, object_auth: &Password)
        -> Result<Vec<u8>>;
}

/// A device backend that can also be shut down.
pub trait Device: Tpm {
    fn shutdown(&mut self) -> Result<()>;
}

/// An open channel to a TPM. Commands go straight to the device.
#[derive(Delegate)]
#[delegate(Tpm, target = "device", where = "D: Tpm")]
pub struct Connection<D> {
    path: String,
    device: D,
}

impl<D: Device> Connection<D> {
    pub fn new(path: impl Into<String>, device: D) -> Self {
        let path = path.into();
        log::debug!("opened TPM {path:?}");
        Self { path, device }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn close(mut self) -> Result<()> {
        log::debug!("closing TPM {:?}", self.path);
        self.device
            .shutdown()
            .map_err(|e| e.context("unable to close connection to TPM"))
    }
}

/// Opens [`Connection`]s by path.
pub trait Opener {
    type Device: Device;

    fn open(&self, path: &str) -> Result<Connection<Self::Device>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn handle_round_trips_as_lowercase_hex() -> Result<()> {
        let handle = Handle::parse_flag("parent-handle", "81000001")?;
        assert_eq!(handle.raw(), 0x8100_0001);
        assert_eq!(handle.to_string(), "81000001");
        assert!(handle.is_persistent());

        let handle = Handle::parse_flag("flush-handle", "0x8000000A")?;
        assert_eq!(handle.to_string(), "8000000a");
        assert!(handle.is_transient());
        Ok(())
    }

    #[test]
    fn handle_flag_errors() {
        let err = Handle::parse_flag("object-handle", "").unwrap_err();
        assert_eq!(err.to_string(), "invalid flag 'object-handle': missing value");
        assert!(Handle::parse_flag("object-handle", "xyz").unwrap_err().is_input());
        assert!(Handle::parse_flag("object-handle", "123456789")
            .unwrap_err()
            .is_input());
    }

    #[test]
    fn sealed_template_is_valid_sealed_data() {
        let template = PublicTemplate::sealed_data(Digest::new(vec![1; 32]));
        assert_eq!(template.validate(ObjectRole::SealedData), Ok(()));
        assert_eq!(
            template.validate(ObjectRole::StorageRoot),
            Err(TemplateError::MissingAttributes(
                ObjectAttributes::RESTRICTED | ObjectAttributes::DECRYPT
            ))
        );
    }

    #[test]
    fn restricted_sealed_data_is_rejected() {
        let mut template = PublicTemplate::sealed_data(Digest::empty());
        template.attributes |= ObjectAttributes::RESTRICTED;
        assert_eq!(
            template.validate(ObjectRole::SealedData),
            Err(TemplateError::ForbiddenAttributes(ObjectAttributes::RESTRICTED))
        );
    }

    #[test]
    fn password_is_not_printed() {
        assert_eq!(format!("{:?}", Password::from("hunter2")), "Password(..)");
    }
}
