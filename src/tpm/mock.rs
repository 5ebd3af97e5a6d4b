//! In-process TPM simulator.
//!
//! Implements just enough of TPM 2.0 for the commands in this crate: PCR banks
//! (SHA-256 and SHA-384), policy digest hash chains, parent-bound private
//! blobs, transient/persistent/session slots with limits, and fault
//! injection. Clones share the same simulated device, so a test can keep one
//! clone to inspect state after a command driver closed its connection.

use super::pcr::{HashAlg, PcrSelection, PCR_COUNT};
use super::{
    AesCfb, Connection, Device, Digest, Handle, Hierarchy, ObjectParams, ObjectRole, Opener,
    Password, PrivateBlob, PublicBlob, PublicTemplate, SealedObject, SessionType,
    StartAuthSession, Tpm, MAX_SEALED_DATA,
};
use crate::error::{Error, Result};
use sha2::{Digest as _, Sha256, Sha384};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

const TPM_CC_POLICY_AUTH_VALUE: u32 = 0x0000_016b;
const TPM_CC_POLICY_PCR: u32 = 0x0000_017f;

const TPM_ALG_RSA: u16 = 0x0001;
const TPM_ALG_AES: u16 = 0x0006;
const TPM_ALG_KEYEDHASH: u16 = 0x0008;
const TPM_ALG_NULL: u16 = 0x0010;
const TPM_ALG_CFB: u16 = 0x0043;

const TRANSIENT_FIRST: u32 = 0x8000_0000;
const HMAC_SESSION_FIRST: u32 = 0x0200_0000;
const POLICY_SESSION_FIRST: u32 = 0x0300_0000;

/// Commands that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    CreatePrimary,
    Create,
    Load,
    EvictControl,
    FlushContext,
    StartAuthSession,
    PolicyPcr,
    PolicyPassword,
    PolicyGetDigest,
    Unseal,
}

/// The response codes the simulator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseCode {
    Attributes,
    AuthFail,
    Failure,
    Handle,
    Hash,
    Integrity,
    NvDefined,
    ObjectMemory,
    PolicyFail,
    SessionMemory,
    Size,
    Type,
    Value,
}

impl ResponseCode {
    fn name(self) -> &'static str {
        match self {
            ResponseCode::Attributes => "TPM_RC_ATTRIBUTES",
            ResponseCode::AuthFail => "TPM_RC_AUTH_FAIL",
            ResponseCode::Failure => "TPM_RC_FAILURE",
            ResponseCode::Handle => "TPM_RC_HANDLE",
            ResponseCode::Hash => "TPM_RC_HASH",
            ResponseCode::Integrity => "TPM_RC_INTEGRITY",
            ResponseCode::NvDefined => "TPM_RC_NV_DEFINED",
            ResponseCode::ObjectMemory => "TPM_RC_OBJECT_MEMORY",
            ResponseCode::PolicyFail => "TPM_RC_POLICY_FAIL",
            ResponseCode::SessionMemory => "TPM_RC_SESSION_MEMORY",
            ResponseCode::Size => "TPM_RC_SIZE",
            ResponseCode::Type => "TPM_RC_TYPE",
            ResponseCode::Value => "TPM_RC_VALUE",
        }
    }

    fn error(self, detail: impl std::fmt::Display) -> Error {
        let msg = format!("{}: {detail}", self.name());
        match self {
            ResponseCode::AuthFail | ResponseCode::PolicyFail => Error::Authorization(msg),
            _ => Error::Device(msg),
        }
    }
}

fn hash(alg: HashAlg, parts: &[&[u8]]) -> Result<Vec<u8>> {
    match alg {
        HashAlg::Sha256 => {
            let mut hasher = Sha256::new();
            parts.iter().for_each(|part| hasher.update(part));
            Ok(hasher.finalize().to_vec())
        }
        HashAlg::Sha384 => {
            let mut hasher = Sha384::new();
            parts.iter().for_each(|part| hasher.update(part));
            Ok(hasher.finalize().to_vec())
        }
        HashAlg::Sha1 => Err(ResponseCode::Hash.error(format!("{alg} is not implemented"))),
    }
}

#[derive(Debug, Clone)]
struct Object {
    template: PublicTemplate,
    auth: Password,
    /// Wrapping secret of a storage key.
    seed: Option<Vec<u8>>,
    /// Payload of a sealed data object.
    data: Vec<u8>,
}

#[derive(Debug)]
struct Session {
    session_type: SessionType,
    hash: HashAlg,
    digest: Vec<u8>,
    password_needed: bool,
}

#[derive(Debug)]
struct State {
    banks: BTreeMap<u16, (HashAlg, Vec<Vec<u8>>)>,
    transient: BTreeMap<u32, Object>,
    persistent: BTreeMap<u32, Object>,
    sessions: BTreeMap<u32, Session>,
    next_transient: u32,
    next_session: u32,
    max_objects: usize,
    max_sessions: usize,
    owner_auth: Password,
    failing: HashSet<Command>,
    fail_open: bool,
    fail_close: bool,
    commands: usize,
    creations: u32,
    connections: usize,
}

impl State {
    fn begin(&mut self, command: Command) -> Result<()> {
        self.commands += 1;
        if self.failing.contains(&command) {
            return Err(ResponseCode::Failure.error(format!("injected failure in {command:?}")));
        }
        Ok(())
    }

    fn object(&self, handle: Handle) -> Result<&Object> {
        let raw = handle.raw();
        self.transient
            .get(&raw)
            .or_else(|| self.persistent.get(&raw))
            .ok_or_else(|| ResponseCode::Handle.error(format!("{handle} is not loaded")))
    }

    fn storage_parent(&self, handle: Handle, auth: &Password) -> Result<Vec<u8>> {
        let parent = self.object(handle)?;
        let seed = match (&parent.seed, parent.template.validate(ObjectRole::StorageRoot)) {
            (Some(seed), Ok(())) => seed.clone(),
            _ => return Err(ResponseCode::Type.error(format!("{handle} is not a storage key"))),
        };
        if &parent.auth != auth {
            return Err(ResponseCode::AuthFail.error(format!("bad authorization for {handle}")));
        }
        Ok(seed)
    }

    fn hierarchy_auth(&self, hierarchy: Hierarchy, auth: &Password) -> Result<()> {
        let expected = match hierarchy {
            Hierarchy::Owner => self.owner_auth.clone(),
            _ => Password::empty(),
        };
        if &expected != auth {
            return Err(ResponseCode::AuthFail.error(format!("bad authorization for {hierarchy:?}")));
        }
        Ok(())
    }

    fn insert_transient(&mut self, object: Object) -> Result<Handle> {
        if self.transient.len() >= self.max_objects {
            return Err(ResponseCode::ObjectMemory.error("no free object slot"));
        }
        let raw = TRANSIENT_FIRST + self.next_transient;
        self.next_transient += 1;
        self.transient.insert(raw, object);
        Ok(Handle::new(raw))
    }

    fn session(&mut self, handle: Handle) -> Result<&mut Session> {
        self.sessions
            .get_mut(&handle.raw())
            .ok_or_else(|| ResponseCode::Handle.error(format!("{handle} is not a loaded session")))
    }

    fn pcr_digest(&self, session_hash: HashAlg, selection: &PcrSelection) -> Result<Vec<u8>> {
        let (_, values) = self
            .banks
            .get(&selection.hash().alg_id())
            .ok_or_else(|| ResponseCode::Hash.error(format!("no {} bank", selection.hash())))?;
        let selected: Vec<&[u8]> = selection
            .pcrs()
            .iter()
            .map(|&pcr| values[usize::from(pcr)].as_slice())
            .collect();
        hash(session_hash, &selected)
    }
}

/// Shared handle on a simulated TPM.
#[derive(Debug, Clone)]
pub struct MockTpm(Rc<RefCell<State>>);

impl Default for MockTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTpm {
    pub fn new() -> Self {
        let mut banks = BTreeMap::new();
        for alg in [HashAlg::Sha256, HashAlg::Sha384] {
            let zeros = vec![vec![0u8; alg.digest_len()]; usize::from(PCR_COUNT)];
            banks.insert(alg.alg_id(), (alg, zeros));
        }
        Self(Rc::new(RefCell::new(State {
            banks,
            transient: BTreeMap::new(),
            persistent: BTreeMap::new(),
            sessions: BTreeMap::new(),
            next_transient: 0,
            next_session: 0,
            max_objects: 3,
            max_sessions: 3,
            owner_auth: Password::empty(),
            failing: HashSet::new(),
            fail_open: false,
            fail_close: false,
            commands: 0,
            creations: 0,
            connections: 0,
        })))
    }

    pub fn with_owner_auth(self, auth: &str) -> Self {
        self.0.borrow_mut().owner_auth = Password::from(auth);
        self
    }

    pub fn with_max_sessions(self, max: usize) -> Self {
        self.0.borrow_mut().max_sessions = max;
        self
    }

    pub fn with_max_objects(self, max: usize) -> Self {
        self.0.borrow_mut().max_objects = max;
        self
    }

    /// Makes every later `command` fail with TPM_RC_FAILURE.
    pub fn fail_on(&self, command: Command) {
        self.0.borrow_mut().failing.insert(command);
    }

    pub fn clear_failures(&self) {
        self.0.borrow_mut().failing.clear();
    }

    pub fn fail_open(&self) {
        self.0.borrow_mut().fail_open = true;
    }

    pub fn fail_close(&self) {
        self.0.borrow_mut().fail_close = true;
    }

    /// Extends `data` into PCR `index` of every bank.
    pub fn extend_pcr(&self, index: u8, data: &[u8]) -> Result<()> {
        if index >= PCR_COUNT {
            return Err(Error::input("pcr", "out of range"));
        }
        let mut state = self.0.borrow_mut();
        for (alg, values) in state.banks.values_mut() {
            let event = hash(*alg, &[data])?;
            let slot = &mut values[usize::from(index)];
            let extended = hash(*alg, &[slot.as_slice(), &event])?;
            *slot = extended;
        }
        Ok(())
    }

    pub fn pcr_value(&self, alg: HashAlg, index: u8) -> Option<Vec<u8>> {
        let state = self.0.borrow();
        let (_, values) = state.banks.get(&alg.alg_id())?;
        values.get(usize::from(index)).cloned()
    }

    pub fn transient_count(&self) -> usize {
        self.0.borrow().transient.len()
    }

    pub fn session_count(&self) -> usize {
        self.0.borrow().sessions.len()
    }

    /// Number of commands received, including failed ones.
    pub fn command_count(&self) -> usize {
        self.0.borrow().commands
    }

    pub fn open_connections(&self) -> usize {
        self.0.borrow().connections
    }

    pub fn is_resident(&self, handle: Handle) -> bool {
        let state = self.0.borrow();
        state.transient.contains_key(&handle.raw())
            || state.persistent.contains_key(&handle.raw())
            || state.sessions.contains_key(&handle.raw())
    }
}

struct Writer(Vec<u8>);

impl Writer {
    fn u16(&mut self, value: u16) -> &mut Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// TPM2B: 16-bit size then the bytes.
    fn sized(&mut self, bytes: &[u8]) -> &mut Self {
        self.u16(bytes.len() as u16);
        self.0.extend_from_slice(bytes);
        self
    }
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.0.len() < len {
            return Err(ResponseCode::Size.error("truncated structure"));
        }
        let (head, tail) = self.0.split_at(len);
        self.0 = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn sized(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()?;
        self.take(usize::from(len))
    }

    fn finish(&self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(ResponseCode::Size.error("trailing bytes"))
        }
    }
}

fn hash_from_id(id: u16) -> Result<HashAlg> {
    [HashAlg::Sha1, HashAlg::Sha256, HashAlg::Sha384]
        .into_iter()
        .find(|alg| alg.alg_id() == id)
        .ok_or_else(|| ResponseCode::Hash.error(format!("unknown hash {id:#06x}")))
}

/// TPMT_PUBLIC of `template` with the given unique field.
fn marshal_public(template: &PublicTemplate, unique: &[u8]) -> Vec<u8> {
    let mut out = Writer(Vec::new());
    let algorithm = match template.params {
        ObjectParams::Rsa { .. } => TPM_ALG_RSA,
        ObjectParams::KeyedHash => TPM_ALG_KEYEDHASH,
    };
    out.u16(algorithm)
        .u16(template.name_alg.alg_id())
        .u32(template.attributes.bits())
        .sized(template.auth_policy.as_bytes());
    match &template.params {
        ObjectParams::Rsa {
            key_bits,
            exponent,
            symmetric,
        } => {
            match symmetric {
                Some(AesCfb { key_bits }) => out.u16(TPM_ALG_AES).u16(*key_bits).u16(TPM_ALG_CFB),
                None => out.u16(TPM_ALG_NULL),
            };
            out.u16(TPM_ALG_NULL).u16(*key_bits).u32(*exponent);
        }
        ObjectParams::KeyedHash => {
            out.u16(TPM_ALG_NULL);
        }
    }
    out.sized(unique);
    out.0
}

fn unmarshal_public(bytes: &[u8]) -> Result<PublicTemplate> {
    let mut input = Reader(bytes);
    let algorithm = input.u16()?;
    let name_alg = hash_from_id(input.u16()?)?;
    let attributes = super::ObjectAttributes::from_bits_retain(input.u32()?);
    let auth_policy = Digest::new(input.sized()?.to_vec());
    let params = match algorithm {
        TPM_ALG_KEYEDHASH => {
            if input.u16()? != TPM_ALG_NULL {
                return Err(ResponseCode::Value.error("unsupported keyed hash scheme"));
            }
            ObjectParams::KeyedHash
        }
        TPM_ALG_RSA => {
            let symmetric = match input.u16()? {
                TPM_ALG_NULL => None,
                TPM_ALG_AES => {
                    let key_bits = input.u16()?;
                    if input.u16()? != TPM_ALG_CFB {
                        return Err(ResponseCode::Value.error("unsupported symmetric mode"));
                    }
                    Some(AesCfb { key_bits })
                }
                other => return Err(ResponseCode::Value.error(format!("symmetric {other:#06x}"))),
            };
            if input.u16()? != TPM_ALG_NULL {
                return Err(ResponseCode::Value.error("unsupported RSA scheme"));
            }
            let key_bits = input.u16()?;
            let exponent = input.u32()?;
            ObjectParams::Rsa {
                key_bits,
                exponent,
                symmetric,
            }
        }
        other => return Err(ResponseCode::Type.error(format!("algorithm {other:#06x}"))),
    };
    input.sized()?;
    input.finish()?;
    Ok(PublicTemplate {
        params,
        name_alg,
        attributes,
        auth_policy,
    })
}

fn object_name(template: &PublicTemplate, public: &[u8]) -> Result<Vec<u8>> {
    let mut name = template.name_alg.alg_id().to_be_bytes().to_vec();
    name.extend(hash(template.name_alg, &[public])?);
    Ok(name)
}

/// XORs `data` with a keystream derived from the parent seed and object name.
fn storage_cipher(seed: &[u8], name: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    for (counter, chunk) in data.chunks(32).enumerate() {
        let pad = hash(
            HashAlg::Sha256,
            &[seed, b"STORAGE", name, &(counter as u32).to_be_bytes()],
        )?;
        out.extend(chunk.iter().zip(pad).map(|(byte, key)| byte ^ key));
    }
    Ok(out)
}

fn integrity(seed: &[u8], name: &[u8], encrypted: &[u8]) -> Result<Vec<u8>> {
    hash(HashAlg::Sha256, &[seed, b"INTEGRITY", encrypted, name])
}

impl Tpm for MockTpm {
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        hierarchy_auth: &Password,
        template: &PublicTemplate,
    ) -> Result<Handle> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::CreatePrimary)?;
        state.hierarchy_auth(hierarchy, hierarchy_auth)?;
        template
            .validate(ObjectRole::StorageRoot)
            .map_err(|e| ResponseCode::Attributes.error(e))?;
        // Primary keys are derived from the hierarchy seed and the template,
        // so the same template always yields the same key.
        let seed = hash(
            HashAlg::Sha256,
            &[
                b"primary seed",
                &[hierarchy as u8],
                &marshal_public(template, &[]),
            ],
        )?;
        state.insert_transient(Object {
            template: template.clone(),
            auth: Password::empty(),
            seed: Some(seed),
            data: Vec::new(),
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
        let mut state = self.0.borrow_mut();
        state.begin(Command::Create)?;
        let seed = state.storage_parent(parent, parent_auth)?;
        template
            .validate(ObjectRole::SealedData)
            .map_err(|e| ResponseCode::Attributes.error(e))?;
        if data.len() > MAX_SEALED_DATA {
            return Err(ResponseCode::Size.error("sensitive data too large"));
        }
        if object_auth.as_bytes().len() > template.name_alg.digest_len() {
            return Err(ResponseCode::Size.error("authorization value too large"));
        }
        state.creations += 1;
        let seed_value = hash(
            template.name_alg,
            &[&seed, b"seed value", &state.creations.to_be_bytes()],
        )?;
        let unique = hash(template.name_alg, &[&seed_value, data])?;
        let public = marshal_public(template, &unique);
        let name = object_name(template, &public)?;

        let mut sensitive = Writer(Vec::new());
        sensitive.sized(object_auth.as_bytes()).sized(data);
        let encrypted = storage_cipher(&seed, &name, &sensitive.0)?;
        let mut private = Writer(Vec::new());
        private.sized(&integrity(&seed, &name, &encrypted)?);
        private.0.extend_from_slice(&encrypted);

        Ok(SealedObject {
            public: PublicBlob::new(public),
            private: PrivateBlob::new(private.0),
        })
    }

    fn load(
        &mut self,
        parent: Handle,
        parent_auth: &Password,
        public: &PublicBlob,
        private: &PrivateBlob,
    ) -> Result<Handle> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::Load)?;
        let seed = state.storage_parent(parent, parent_auth)?;
        let template = unmarshal_public(public.as_bytes())?;
        template
            .validate(ObjectRole::SealedData)
            .map_err(|e| ResponseCode::Type.error(e))?;
        let name = object_name(&template, public.as_bytes())?;

        let mut input = Reader(private.as_bytes());
        let tag = input.sized()?;
        let encrypted = input.0;
        if integrity(&seed, &name, encrypted)? != tag {
            return Err(ResponseCode::Integrity.error("private area does not match parent"));
        }
        let sensitive = storage_cipher(&seed, &name, encrypted)?;
        let mut input = Reader(&sensitive);
        let auth = Password::new(input.sized()?.to_vec());
        let data = input.sized()?.to_vec();
        input.finish()?;

        state.insert_transient(Object {
            template,
            auth,
            seed: None,
            data,
        })
    }

    fn evict_control(
        &mut self,
        hierarchy: Hierarchy,
        auth: &Password,
        object: Handle,
        persistent: Handle,
    ) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::EvictControl)?;
        if !matches!(hierarchy, Hierarchy::Owner | Hierarchy::Platform) {
            return Err(ResponseCode::Value.error(format!("{hierarchy:?} cannot persist objects")));
        }
        state.hierarchy_auth(hierarchy, auth)?;
        if !persistent.is_persistent() {
            return Err(ResponseCode::Value.error(format!("{persistent} is not persistent")));
        }
        if object.is_persistent() {
            if object != persistent {
                return Err(ResponseCode::Value.error("persistent handles differ"));
            }
            return state
                .persistent
                .remove(&persistent.raw())
                .map(|_| ())
                .ok_or_else(|| ResponseCode::Handle.error(format!("{persistent} is not resident")));
        }
        let copy = state
            .transient
            .get(&object.raw())
            .cloned()
            .ok_or_else(|| ResponseCode::Handle.error(format!("{object} is not loaded")))?;
        if state.persistent.contains_key(&persistent.raw()) {
            return Err(ResponseCode::NvDefined.error(format!("{persistent} is occupied")));
        }
        state.persistent.insert(persistent.raw(), copy);
        Ok(())
    }

    fn flush_context(&mut self, handle: Handle) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::FlushContext)?;
        let removed = if handle.is_session() {
            state.sessions.remove(&handle.raw()).is_some()
        } else if handle.is_transient() {
            state.transient.remove(&handle.raw()).is_some()
        } else {
            false
        };
        if removed {
            Ok(())
        } else {
            Err(ResponseCode::Handle.error(format!("{handle} cannot be flushed")))
        }
    }

    fn start_auth_session(&mut self, params: &StartAuthSession) -> Result<Handle> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::StartAuthSession)?;
        if state.sessions.len() >= state.max_sessions {
            return Err(ResponseCode::SessionMemory.error("no free session slot"));
        }
        for key in [params.tpm_key, params.bind_key] {
            if key != Handle::NULL {
                state.object(key)?;
            }
        }
        let digest_len = params.auth_hash.digest_len();
        hash(params.auth_hash, &[])?;
        if params.nonce_caller.len() < 16 || params.nonce_caller.len() > digest_len {
            return Err(ResponseCode::Size.error("nonceCaller"));
        }
        let first = match params.session_type {
            SessionType::Hmac => HMAC_SESSION_FIRST,
            SessionType::Policy | SessionType::Trial => POLICY_SESSION_FIRST,
        };
        let raw = first + state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            raw,
            Session {
                session_type: params.session_type,
                hash: params.auth_hash,
                digest: vec![0; digest_len],
                password_needed: false,
            },
        );
        Ok(Handle::new(raw))
    }

    fn policy_pcr(
        &mut self,
        session: Handle,
        expected: &Digest,
        selection: &PcrSelection,
    ) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::PolicyPcr)?;
        let session_hash = state.session(session)?.hash;
        let pcr_digest = state.pcr_digest(session_hash, selection)?;
        if !expected.is_empty() && expected.as_bytes() != pcr_digest.as_slice() {
            return Err(ResponseCode::Value.error("PCR values do not match expected digest"));
        }
        let session = state.session(session)?;
        session.digest = hash(
            session.hash,
            &[
                &session.digest,
                &TPM_CC_POLICY_PCR.to_be_bytes(),
                &selection.marshal(),
                &pcr_digest,
            ],
        )?;
        Ok(())
    }

    fn policy_password(&mut self, session: Handle) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::PolicyPassword)?;
        let session = state.session(session)?;
        session.digest = hash(
            session.hash,
            &[&session.digest, &TPM_CC_POLICY_AUTH_VALUE.to_be_bytes()],
        )?;
        session.password_needed = true;
        Ok(())
    }

    fn policy_get_digest(&mut self, session: Handle) -> Result<Digest> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::PolicyGetDigest)?;
        Ok(Digest::new(state.session(session)?.digest.clone()))
    }

    fn unseal(
        &mut self,
        session: Handle,
        object: Handle,
        object_auth: &Password,
    ) -> Result<Vec<u8>> {
        let mut state = self.0.borrow_mut();
        state.begin(Command::Unseal)?;
        let (session_type, digest, password_needed) = {
            let session = state.session(session)?;
            (
                session.session_type,
                session.digest.clone(),
                session.password_needed,
            )
        };
        if session_type != SessionType::Policy {
            return Err(ResponseCode::Type.error(format!("{session} is not a policy session")));
        }
        let object = state.object(object)?;
        if object.template.params != ObjectParams::KeyedHash {
            return Err(ResponseCode::Type.error("not a sealed data object"));
        }
        if object.template.auth_policy.as_bytes() != digest.as_slice() {
            return Err(ResponseCode::PolicyFail.error("policy digest mismatch"));
        }
        if password_needed && &object.auth != object_auth {
            return Err(ResponseCode::AuthFail.error("wrong object password"));
        }
        Ok(object.data.clone())
    }
}

impl Device for MockTpm {
    fn shutdown(&mut self) -> Result<()> {
        let mut state = self.0.borrow_mut();
        state.connections = state.connections.saturating_sub(1);
        if state.fail_close {
            return Err(Error::Transport("broken pipe".into()));
        }
        Ok(())
    }
}

impl Opener for MockTpm {
    type Device = MockTpm;

    fn open(&self, path: &str) -> Result<Connection<MockTpm>> {
        {
            let mut state = self.0.borrow_mut();
            if state.fail_open {
                return Err(Error::Transport(format!(
                    "can't open TPM {path:?}: no such device"
                )));
            }
            state.connections += 1;
        }
        Ok(Connection::new(path, self.clone()))
    }
}
