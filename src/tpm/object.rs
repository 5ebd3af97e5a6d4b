//! Creating, loading, persisting and flushing TPM objects.

use super::pcr::HashAlg;
use super::{
    AesCfb, Handle, Hierarchy, ObjectAttributes, ObjectParams, ObjectRole, Password,
    PrivateBlob, PublicBlob, PublicTemplate, Tpm,
};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;

/// Shared storage root key template from the TCG provisioning guidance:
/// RSA-2048 restricted decryption key with an AES-128-CFB symmetric scheme.
static SRK_TEMPLATE: Lazy<PublicTemplate> = Lazy::new(|| PublicTemplate {
    params: ObjectParams::Rsa {
        key_bits: 2048,
        exponent: 0,
        symmetric: Some(AesCfb { key_bits: 128 }),
    },
    name_alg: HashAlg::Sha256,
    attributes: ObjectAttributes::FIXED_TPM
        | ObjectAttributes::FIXED_PARENT
        | ObjectAttributes::SENSITIVE_DATA_ORIGIN
        | ObjectAttributes::USER_WITH_AUTH
        | ObjectAttributes::RESTRICTED
        | ObjectAttributes::DECRYPT
        | ObjectAttributes::NO_DA,
    auth_policy: Default::default(),
});

pub fn srk_template() -> &'static PublicTemplate {
    &SRK_TEMPLATE
}

/// Creates a primary storage key under `hierarchy`. The handle stays resident.
pub fn create_primary<T: Tpm + ?Sized>(
    tpm: &mut T,
    hierarchy: Hierarchy,
    hierarchy_auth: &Password,
    template: &PublicTemplate,
) -> Result<Handle> {
    template
        .validate(ObjectRole::StorageRoot)
        .map_err(|e| Error::input("template", e))?;
    let handle = tpm
        .create_primary(hierarchy, hierarchy_auth, template)
        .map_err(|e| e.context("can't create primary key"))?;
    log::info!("created primary key {handle} under {hierarchy:?}");
    Ok(handle)
}

/// Loads a previously created object under a resident parent.
pub fn load<T: Tpm + ?Sized>(
    tpm: &mut T,
    parent: Handle,
    parent_auth: &Password,
    public: &PublicBlob,
    private: &PrivateBlob,
) -> Result<Handle> {
    let handle = tpm
        .load(parent, parent_auth, public, private)
        .map_err(|e| e.context("unable to load data"))?;
    log::info!("loaded object {handle} under {parent}");
    Ok(handle)
}

/// Persists `object` at `persistent`, or evicts `persistent` when both are the
/// same handle.
pub fn evict_control<T: Tpm + ?Sized>(
    tpm: &mut T,
    hierarchy: Hierarchy,
    auth: &Password,
    object: Handle,
    persistent: Handle,
) -> Result<()> {
    if !persistent.is_persistent() {
        return Err(Error::input(
            "persistent-handle",
            format!("{persistent} is not in the persistent range"),
        ));
    }
    tpm.evict_control(hierarchy, auth, object, persistent)
        .map_err(|e| e.context("unable to evict object"))?;
    if object == persistent {
        log::info!("evicted persistent object {persistent}");
    } else {
        log::info!("persisted {object} at {persistent}");
    }
    Ok(())
}

pub fn flush_context<T: Tpm + ?Sized>(tpm: &mut T, handle: Handle) -> Result<()> {
    tpm.flush_context(handle)
        .map_err(|e| e.context("unable to flush object"))?;
    log::debug!("flushed {handle}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm::mock::MockTpm;
    use eyre::Result;

    #[test]
    fn srk_template_is_a_storage_root() {
        assert_eq!(srk_template().validate(ObjectRole::StorageRoot), Ok(()));
    }

    #[test]
    fn create_primary_yields_transient_handle() -> Result<()> {
        let mut tpm = MockTpm::new();
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
        assert!(srk.is_transient());
        assert_eq!(tpm.transient_count(), 1);
        Ok(())
    }

    #[test]
    fn create_primary_rejects_non_storage_template() {
        let mut tpm = MockTpm::new();
        let template = PublicTemplate::sealed_data(Default::default());
        let err = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), &template)
            .unwrap_err();
        assert!(err.is_input());
        assert_eq!(tpm.command_count(), 0);
    }

    #[test]
    fn create_primary_with_wrong_owner_auth() {
        let mut tpm = MockTpm::new().with_owner_auth("owner");
        let err = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())
            .unwrap_err();
        assert!(err.is_authorization());
        assert_eq!(tpm.transient_count(), 0);
    }

    #[test]
    fn evict_round_trip() -> Result<()> {
        let mut tpm = MockTpm::new();
        let owner = Password::empty();
        let persistent = Handle::new(0x8100_0001);
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &owner, srk_template())?;

        evict_control(&mut tpm, Hierarchy::Owner, &owner, srk, persistent)?;
        assert!(tpm.is_resident(persistent));

        evict_control(&mut tpm, Hierarchy::Owner, &owner, persistent, persistent)?;
        assert!(!tpm.is_resident(persistent));

        // Already gone: a device error, not a panic.
        let err = evict_control(&mut tpm, Hierarchy::Owner, &owner, persistent, persistent)
            .unwrap_err();
        assert!(err.is_device());
        Ok(())
    }

    #[test]
    fn evict_into_occupied_slot_collides() -> Result<()> {
        let mut tpm = MockTpm::new();
        let owner = Password::empty();
        let persistent = Handle::new(0x8100_0002);
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &owner, srk_template())?;
        evict_control(&mut tpm, Hierarchy::Owner, &owner, srk, persistent)?;
        let err = evict_control(&mut tpm, Hierarchy::Owner, &owner, srk, persistent).unwrap_err();
        assert!(err.is_device());
        Ok(())
    }

    #[test]
    fn evict_to_non_persistent_handle_is_input_error() {
        let mut tpm = MockTpm::new();
        let err = evict_control(
            &mut tpm,
            Hierarchy::Owner,
            &Password::empty(),
            Handle::new(0x8000_0000),
            Handle::new(0x8000_0001),
        )
        .unwrap_err();
        assert!(err.is_input());
        assert_eq!(tpm.command_count(), 0);
    }

    #[test]
    fn flush_releases_slot() -> Result<()> {
        let mut tpm = MockTpm::new();
        let srk = create_primary(&mut tpm, Hierarchy::Owner, &Password::empty(), srk_template())?;
        flush_context(&mut tpm, srk)?;
        assert_eq!(tpm.transient_count(), 0);
        assert!(flush_context(&mut tpm, srk).unwrap_err().is_device());
        Ok(())
    }
}
