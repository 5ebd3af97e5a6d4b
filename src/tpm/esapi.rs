//! Device backend on top of the TSS2 Enhanced System API.
//!
//! ESAPI names resident objects through its own `ObjectHandle`s (ESYS_TRs).
//! Each TPM handle is looked up once per connection and the ESYS_TR is kept
//! until the object is flushed or the connection closes. The TPM handle of a
//! newly created or loaded object is found by comparing the transient handles
//! the TPM reports before and after the command.
//!
//! Sessions never leave the connection that started them, so they are named
//! by their ESYS_TR value rather than a TPM handle.

use super::pcr::{HashAlg, PcrSelection};
use super::{
    AesCfb, Connection, Device, Digest, Handle, Hierarchy, ObjectAttributes, ObjectParams,
    Opener, Password, PrivateBlob, PublicBlob, PublicTemplate, SealedObject, SessionType,
    StartAuthSession, Tpm,
};
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::constants::response_code::Tss2ResponseCodeKind;
use tss_esapi::constants::{CapabilityType, SessionType as EsapiSessionType};
use tss_esapi::handles::{KeyHandle, ObjectHandle, PersistentTpmHandle, SessionHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::{Hierarchy as EsapiHierarchy, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, PolicySession};
use tss_esapi::structures::{
    Auth, CapabilityData, Digest as EsapiDigest, KeyedHashScheme, Nonce, PcrSelectionListBuilder, PcrSlot,
    Private, Public, PublicBuilder, PublicKeyRsa, PublicKeyedHashParameters,
    PublicRsaParameters, RsaExponent, RsaScheme, SensitiveData, SymmetricDefinition,
    SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::traits::{Marshall, UnMarshall};
use tss_esapi::tss2_esys::ESYS_TR;
use tss_esapi::Error::Tss2Error;

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const MAX_HANDLES: u32 = 80;

/// Response codes meaning a wrong secret or a policy that doesn't hold.
fn is_authorization(kind: Option<Tss2ResponseCodeKind>) -> bool {
    matches!(
        kind,
        Some(
            Tss2ResponseCodeKind::AuthFail
                | Tss2ResponseCodeKind::BadAuth
                | Tss2ResponseCodeKind::PolicyFail
                | Tss2ResponseCodeKind::PcrChanged
                | Tss2ResponseCodeKind::AuthMissing
                | Tss2ResponseCodeKind::AuthUnavailable
        )
    )
}

fn device_error(err: tss_esapi::Error) -> Error {
    let message = err.to_string();
    match err {
        Tss2Error(rc) if is_authorization(rc.kind()) => Error::Authorization(message),
        _ => Error::Device(message),
    }
}

fn hashing_algorithm(alg: HashAlg) -> HashingAlgorithm {
    match alg {
        HashAlg::Sha1 => HashingAlgorithm::Sha1,
        HashAlg::Sha256 => HashingAlgorithm::Sha256,
        HashAlg::Sha384 => HashingAlgorithm::Sha384,
    }
}

fn auth(password: &Password) -> Result<Auth> {
    Auth::try_from(password.as_bytes().to_vec()).map_err(device_error)
}

fn object_attributes(attributes: ObjectAttributes) -> Result<tss_esapi::attributes::ObjectAttributes> {
    ObjectAttributesBuilder::new()
        .with_fixed_tpm(attributes.contains(ObjectAttributes::FIXED_TPM))
        .with_fixed_parent(attributes.contains(ObjectAttributes::FIXED_PARENT))
        .with_sensitive_data_origin(attributes.contains(ObjectAttributes::SENSITIVE_DATA_ORIGIN))
        .with_user_with_auth(attributes.contains(ObjectAttributes::USER_WITH_AUTH))
        .with_no_da(attributes.contains(ObjectAttributes::NO_DA))
        .with_restricted(attributes.contains(ObjectAttributes::RESTRICTED))
        .with_decrypt(attributes.contains(ObjectAttributes::DECRYPT))
        .with_sign_encrypt(attributes.contains(ObjectAttributes::SIGN_ENCRYPT))
        .build()
        .map_err(device_error)
}

fn symmetric_object(aes: AesCfb) -> Result<SymmetricDefinitionObject> {
    match aes.key_bits {
        128 => Ok(SymmetricDefinitionObject::AES_128_CFB),
        256 => Ok(SymmetricDefinitionObject::AES_256_CFB),
        bits => Err(Error::input("template", format!("AES-{bits} is not supported"))),
    }
}

fn public(template: &PublicTemplate) -> Result<Public> {
    let builder = PublicBuilder::new()
        .with_name_hashing_algorithm(hashing_algorithm(template.name_alg))
        .with_object_attributes(object_attributes(template.attributes)?)
        .with_auth_policy(
            EsapiDigest::try_from(template.auth_policy.as_bytes().to_vec())
                .map_err(device_error)?,
        );
    let builder = match &template.params {
        ObjectParams::Rsa {
            key_bits,
            exponent,
            symmetric,
        } => {
            let symmetric = match symmetric {
                Some(aes) => symmetric_object(*aes)?,
                None => SymmetricDefinitionObject::Null,
            };
            let key_bits = RsaKeyBits::try_from(*key_bits).map_err(device_error)?;
            let exponent = RsaExponent::create(*exponent).map_err(device_error)?;
            builder
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_rsa_parameters(PublicRsaParameters::new(
                    symmetric,
                    RsaScheme::Null,
                    key_bits,
                    exponent,
                ))
                .with_rsa_unique_identifier(PublicKeyRsa::default())
        }
        ObjectParams::KeyedHash => builder
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(EsapiDigest::default()),
    };
    builder.build().map_err(device_error)
}

fn pcr_selection_list(
    selection: &PcrSelection,
) -> Result<tss_esapi::structures::PcrSelectionList> {
    let slots = selection
        .pcrs()
        .iter()
        .map(|&pcr| PcrSlot::try_from(1u32 << pcr).map_err(device_error))
        .collect::<Result<Vec<PcrSlot>>>()?;
    PcrSelectionListBuilder::new()
        .with_selection(hashing_algorithm(selection.hash()), &slots)
        .build()
        .map_err(device_error)
}

fn esapi_hierarchy(hierarchy: Hierarchy) -> EsapiHierarchy {
    match hierarchy {
        Hierarchy::Owner => EsapiHierarchy::Owner,
        Hierarchy::Platform => EsapiHierarchy::Platform,
        Hierarchy::Endorsement => EsapiHierarchy::Endorsement,
        Hierarchy::Null => EsapiHierarchy::Null,
    }
}

/// A TCTI configuration: a full TCTI string, or a bare device path.
pub fn tcti(path: &str) -> Result<TctiNameConf> {
    let conf = if path.contains(':') {
        TctiNameConf::from_str(path)
    } else {
        DeviceConfig::from_str(path).map(TctiNameConf::Device)
    };
    conf.map_err(|e| Error::Transport(format!("invalid TPM path {path:?}: {e}")))
}

pub struct EsapiTpm {
    ctx: Option<tss_esapi::Context>,
    objects: HashMap<u32, ObjectHandle>,
    sessions: HashMap<ESYS_TR, AuthSession>,
}

impl EsapiTpm {
    pub fn new(conf: TctiNameConf) -> Result<Self> {
        log::debug!("TCTI config {:?}", conf);
        let ctx = tss_esapi::Context::new(conf).map_err(|e| Error::Transport(e.to_string()))?;
        Ok(Self {
            ctx: Some(ctx),
            objects: HashMap::new(),
            sessions: HashMap::new(),
        })
    }

    fn ctx(&mut self) -> Result<&mut tss_esapi::Context> {
        self.ctx
            .as_mut()
            .ok_or_else(|| Error::Transport("connection to TPM is closed".into()))
    }

    /// Resident handles of the same type as `first`, starting at `first`.
    fn handles(&mut self, first: u32) -> Result<HashSet<u32>> {
        let (capabilities, _) = self
            .ctx()?
            .get_capability(CapabilityType::Handles, first, MAX_HANDLES)
            .map_err(device_error)?;
        match capabilities {
            CapabilityData::Handles(handles) => Ok(handles
                .into_inner()
                .into_iter()
                .map(u32::from)
                .filter(|raw| raw >> 24 == first >> 24)
                .collect()),
            _ => Err(Error::Device("TPM returned the wrong capability".into())),
        }
    }

    /// Runs a command that leaves one new transient object behind and
    /// returns its TPM handle.
    fn new_transient<F>(&mut self, command: F) -> Result<Handle>
    where
        F: FnOnce(&mut tss_esapi::Context) -> tss_esapi::Result<ObjectHandle>,
    {
        let before = self.handles(TRANSIENT_FIRST)?;
        let object = command(self.ctx()?).map_err(device_error)?;
        let after = self.handles(TRANSIENT_FIRST)?;
        let added: Vec<u32> = after.difference(&before).copied().collect();
        match added[..] {
            [raw] => {
                self.objects.insert(raw, object);
                Ok(Handle::new(raw))
            }
            _ => {
                self.ctx()?.flush_context(object).ok();
                Err(Error::Device(format!(
                    "expected one new transient handle, TPM reports {}",
                    added.len()
                )))
            }
        }
    }

    fn object(&mut self, handle: Handle) -> Result<ObjectHandle> {
        if let Some(object) = self.objects.get(&handle.raw()) {
            return Ok(*object);
        }
        let tpm_handle = TpmHandle::try_from(handle.raw()).map_err(device_error)?;
        let object = self
            .ctx()?
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(tpm_handle))
            .map_err(device_error)?;
        self.objects.insert(handle.raw(), object);
        Ok(object)
    }

    fn session(&self, session: Handle) -> Result<AuthSession> {
        self.sessions
            .get(&session.raw())
            .copied()
            .ok_or_else(|| Error::Device(format!("{session} is not a session of this connection")))
    }

    fn policy_session(&self, session: Handle) -> Result<PolicySession> {
        PolicySession::try_from(self.session(session)?).map_err(device_error)
    }
}

impl Tpm for EsapiTpm {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        hierarchy_auth: &Password,
        template: &PublicTemplate,
    ) -> Result<Handle> {
        let public = public(template)?;
        let hierarchy = esapi_hierarchy(hierarchy);
        let auth = auth(hierarchy_auth)?;
        self.ctx()?
            .tr_set_auth(hierarchy.into(), auth)
            .map_err(device_error)?;
        self.new_transient(|ctx| {
            ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create_primary(hierarchy, public, None, None, None, None)
            })
            .map(|result| result.key_handle.into())
        })
    }

    fn create(
        &mut self,
        parent: Handle,
        parent_auth: &Password,
        template: &PublicTemplate,
        object_auth: &Password,
        data: &[u8],
    ) -> Result<SealedObject> {
        let public = public(template)?;
        let sensitive = SensitiveData::try_from(data.to_vec()).map_err(device_error)?;
        let object_auth = auth(object_auth)?;
        let parent_auth = auth(parent_auth)?;
        let parent = self.object(parent)?;
        let ctx = self.ctx()?;
        ctx.tr_set_auth(parent, parent_auth).map_err(device_error)?;
        let result = ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.create(
                    KeyHandle::from(parent),
                    public,
                    Some(object_auth),
                    Some(sensitive),
                    None,
                    None,
                )
            })
            .map_err(device_error)?;
        Ok(SealedObject {
            public: PublicBlob::new(result.out_public.marshall().map_err(device_error)?),
            private: PrivateBlob::new(result.out_private.value().to_vec()),
        })
    }

    fn load(
        &mut self,
        parent: Handle,
        parent_auth: &Password,
        public: &PublicBlob,
        private: &PrivateBlob,
    ) -> Result<Handle> {
        let public = Public::unmarshall(public.as_bytes()).map_err(device_error)?;
        let private = Private::try_from(private.as_bytes().to_vec()).map_err(device_error)?;
        let parent_auth = auth(parent_auth)?;
        let parent = self.object(parent)?;
        self.ctx()?
            .tr_set_auth(parent, parent_auth)
            .map_err(device_error)?;
        self.new_transient(|ctx| {
            ctx.execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.load(KeyHandle::from(parent), private, public)
            })
            .map(ObjectHandle::from)
        })
    }

    fn evict_control(
        &mut self,
        hierarchy: Hierarchy,
        auth_value: &Password,
        object: Handle,
        persistent: Handle,
    ) -> Result<()> {
        let provision = match hierarchy {
            Hierarchy::Owner => Provision::Owner,
            Hierarchy::Platform => Provision::Platform,
            other => {
                return Err(Error::input(
                    "hierarchy",
                    format!("{other:?} cannot persist objects"),
                ))
            }
        };
        let persistent_handle =
            PersistentTpmHandle::new(persistent.raw()).map_err(device_error)?;
        let auth_value = auth(auth_value)?;
        let evicted = object == persistent;
        let object = self.object(object)?;
        let ctx = self.ctx()?;
        ctx.tr_set_auth(esapi_hierarchy(hierarchy).into(), auth_value)
            .map_err(device_error)?;
        let result = ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(provision, object, Persistent::Persistent(persistent_handle))
            })
            .map_err(device_error)?;
        // ESAPI invalidates the ESYS_TR of an evicted persistent object.
        if evicted {
            self.objects.remove(&persistent.raw());
        } else if result != ObjectHandle::None {
            self.objects.insert(persistent.raw(), result);
        }
        Ok(())
    }

    fn flush_context(&mut self, handle: Handle) -> Result<()> {
        if let Some(session) = self.sessions.remove(&handle.raw()) {
            let session_handle = SessionHandle::from(session);
            return self
                .ctx()?
                .flush_context(session_handle.into())
                .map_err(device_error);
        }
        let object = self.object(handle)?;
        self.ctx()?.flush_context(object).map_err(device_error)?;
        self.objects.remove(&handle.raw());
        Ok(())
    }

    fn start_auth_session(&mut self, params: &StartAuthSession) -> Result<Handle> {
        let tpm_key = match params.tpm_key {
            Handle::NULL => None,
            key => Some(KeyHandle::from(self.object(key)?)),
        };
        let bind_key = match params.bind_key {
            Handle::NULL => None,
            key => Some(self.object(key)?),
        };
        if !params.secret.is_empty() {
            return Err(Error::input("secret", "salted sessions are not supported"));
        }
        let nonce = Nonce::try_from(params.nonce_caller.clone()).map_err(device_error)?;
        let session_type = match params.session_type {
            SessionType::Hmac => EsapiSessionType::Hmac,
            SessionType::Policy => EsapiSessionType::Policy,
            SessionType::Trial => EsapiSessionType::Trial,
        };
        let symmetric = match params.symmetric.map(|aes| aes.key_bits) {
            None => SymmetricDefinition::Null,
            Some(128) => SymmetricDefinition::AES_128_CFB,
            Some(256) => SymmetricDefinition::AES_256_CFB,
            Some(bits) => {
                return Err(Error::input("symmetric", format!("AES-{bits} is not supported")))
            }
        };
        let session = self
            .ctx()?
            .start_auth_session(
                tpm_key,
                bind_key,
                Some(nonce),
                session_type,
                symmetric,
                hashing_algorithm(params.auth_hash),
            )
            .map_err(device_error)?
            .ok_or_else(|| Error::Device("received invalid session handle".into()))?;
        let esys_tr = ESYS_TR::from(ObjectHandle::from(SessionHandle::from(session)));
        self.sessions.insert(esys_tr, session);
        Ok(Handle::new(esys_tr))
    }

    fn policy_pcr(
        &mut self,
        session: Handle,
        expected: &Digest,
        selection: &PcrSelection,
    ) -> Result<()> {
        let session = self.policy_session(session)?;
        let expected = EsapiDigest::try_from(expected.as_bytes().to_vec()).map_err(device_error)?;
        let selection = pcr_selection_list(selection)?;
        self.ctx()?
            .policy_pcr(session, expected, selection)
            .map_err(device_error)
    }

    fn policy_password(&mut self, session: Handle) -> Result<()> {
        let session = self.policy_session(session)?;
        self.ctx()?.policy_password(session).map_err(device_error)
    }

    fn policy_get_digest(&mut self, session: Handle) -> Result<Digest> {
        let session = self.policy_session(session)?;
        let digest = self
            .ctx()?
            .policy_get_digest(session)
            .map_err(device_error)?;
        Ok(Digest::new(digest.value().to_vec()))
    }

    fn unseal(
        &mut self,
        session: Handle,
        object: Handle,
        object_auth: &Password,
    ) -> Result<Vec<u8>> {
        let session = self.session(session)?;
        let object_auth = auth(object_auth)?;
        let object = self.object(object)?;
        let ctx = self.ctx()?;
        ctx.tr_set_auth(object, object_auth).map_err(device_error)?;
        let data = ctx
            .execute_with_session(Some(session), |ctx| ctx.unseal(object))
            .map_err(device_error)?;
        Ok(data.value().to_vec())
    }
}

impl Device for EsapiTpm {
    fn shutdown(&mut self) -> Result<()> {
        if !self.sessions.is_empty() {
            log::warn!("closing TPM with {} live sessions", self.sessions.len());
        }
        self.sessions.clear();
        self.objects.clear();
        match self.ctx.take() {
            Some(ctx) => {
                drop(ctx);
                Ok(())
            }
            None => Err(Error::Transport("connection to TPM already closed".into())),
        }
    }
}

/// Opens device files and TCTI strings through the native TSS stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct EsapiOpener;

impl Opener for EsapiOpener {
    type Device = EsapiTpm;

    fn open(&self, path: &str) -> Result<Connection<EsapiTpm>> {
        let device = tcti(path)
            .and_then(EsapiTpm::new)
            .map_err(|e| Error::Transport(format!("can't open TPM {path:?}: {e}")))?;
        Ok(Connection::new(path, device))
    }
}
