//! One driver per subcommand.
//!
//! A driver validates its flags, opens the TPM, runs the operation and closes
//! the TPM again. Nothing is opened when a flag is invalid. Every failure,
//! including a failed close, is pushed onto the caller's [`Errors`].

use crate::blob::{BlobSource, FileBlob};
use crate::cli::{
    CreateSrkArgs, EvictControlArgs, FlushContextArgs, LoadArgs, SealArgs, UnsealArgs,
};
use crate::error::{Error, Errors, Result};
use crate::tpm::object::{self, srk_template};
use crate::tpm::pcr::{parse_pcr_index, HashAlg, PcrSelection};
use crate::tpm::seal::{self, Payload};
use crate::tpm::{Connection, Handle, Hierarchy, Opener, Password, PrivateBlob, PublicBlob};
use std::io::Write;

/// Settings shared by every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub tpm_path: String,
    pub pcr_bank: HashAlg,
}

/// Opens the TPM at `settings.tpm_path`, runs `f` and closes the TPM whatever
/// `f` returned. A failed close is recorded after the errors of `f`.
fn with_tpm<O, R, F>(opener: &O, settings: &Settings, errors: &mut Errors, f: F) -> Option<R>
where
    O: Opener,
    F: FnOnce(&mut Connection<O::Device>, &mut Errors) -> Option<R>,
{
    let mut tpm = errors.collect(opener.open(&settings.tpm_path))?;
    let value = f(&mut tpm, errors);
    errors.collect(tpm.close());
    value
}

fn pcr_selection(bank: HashAlg, pcr: &str) -> Result<Option<PcrSelection>> {
    let index = parse_pcr_index(pcr).map_err(|e| Error::input("pcr", e))?;
    PcrSelection::from_index(bank, index).map_err(|e| Error::input("pcr", e))
}

fn print_handle(out: &mut dyn Write, handle: Handle) -> Result<()> {
    writeln!(out, "{handle}").map_err(|e| Error::Storage {
        context: "couldn't write to".into(),
        path: "stdout".into(),
        reason: e.to_string(),
    })
}

/// Creates the shared SRK template under the owner hierarchy. The new handle
/// is printed and stays resident.
pub fn create_srk<O: Opener>(
    opener: &O,
    settings: &Settings,
    args: &CreateSrkArgs,
    errors: &mut Errors,
    out: &mut dyn Write,
) {
    let owner_auth = Password::from(args.owner_password.as_str());
    let Some(handle) = with_tpm(opener, settings, errors, |tpm, errors| {
        errors.collect(object::create_primary(
            tpm,
            Hierarchy::Owner,
            &owner_auth,
            srk_template(),
        ))
    }) else {
        return;
    };
    errors.collect(print_handle(out, handle));
}

/// Loads a sealed object from its public and private files and prints the
/// new handle.
pub fn load<O: Opener>(
    opener: &O,
    settings: &Settings,
    args: &LoadArgs,
    errors: &mut Errors,
    out: &mut dyn Write,
) {
    let Some(parent) = errors.collect(Handle::parse_flag("parent-handle", &args.parent_handle))
    else {
        return;
    };
    let Some(public) = errors.collect(FileBlob::new(&args.public_path).fetch()) else {
        return;
    };
    let Some(private) = errors.collect(FileBlob::new(&args.private_path).fetch()) else {
        return;
    };
    let parent_auth = Password::from(args.parent_password.as_str());
    let (public, private) = (PublicBlob::new(public), PrivateBlob::new(private));

    let Some(handle) = with_tpm(opener, settings, errors, |tpm, errors| {
        errors.collect(object::load(tpm, parent, &parent_auth, &public, &private))
    }) else {
        return;
    };
    errors.collect(print_handle(out, handle));
}

pub fn seal<O: Opener>(opener: &O, settings: &Settings, args: &SealArgs, errors: &mut Errors) {
    let parent = Handle::parse_flag("parent-handle", &args.parent_handle);
    let payload = Payload::from_hex(&args.data);
    let pcrs = pcr_selection(settings.pcr_bank, &args.pcr);
    let (Some(parent), Some(payload), Some(pcrs)) = (
        errors.collect(parent),
        errors.collect(payload),
        errors.collect(pcrs),
    ) else {
        return;
    };
    let parent_auth = Password::from(args.parent_password.as_str());
    let object_password = Password::from(args.object_password.as_str());
    let mut private_sink = FileBlob::new(&args.private_path);
    let mut public_sink = FileBlob::new(&args.public_path);

    with_tpm(opener, settings, errors, |tpm, errors| {
        seal::seal(
            tpm,
            errors,
            parent,
            &parent_auth,
            &object_password,
            &payload,
            pcrs.as_ref(),
            &mut private_sink,
            &mut public_sink,
        )
        .then_some(())
    });
}

pub fn unseal<O: Opener>(opener: &O, settings: &Settings, args: &UnsealArgs, errors: &mut Errors) {
    let object = Handle::parse_flag("object-handle", &args.object_handle);
    let pcrs = pcr_selection(settings.pcr_bank, &args.pcr);
    let (Some(object), Some(pcrs)) = (errors.collect(object), errors.collect(pcrs)) else {
        return;
    };
    let object_password = Password::from(args.object_password.as_str());
    let mut sink = FileBlob::new(&args.output_path);

    with_tpm(opener, settings, errors, |tpm, errors| {
        seal::unseal(
            tpm,
            errors,
            object,
            &object_password,
            pcrs.as_ref(),
            &mut sink,
        )
        .then_some(())
    });
}

pub fn evict_control<O: Opener>(
    opener: &O,
    settings: &Settings,
    args: &EvictControlArgs,
    errors: &mut Errors,
) {
    let object = Handle::parse_flag("object-handle", &args.object_handle);
    let persistent = Handle::parse_flag("persistent-handle", &args.persistent_handle);
    let (Some(object), Some(persistent)) = (errors.collect(object), errors.collect(persistent))
    else {
        return;
    };
    let owner_auth = Password::from(args.owner_password.as_str());

    with_tpm(opener, settings, errors, |tpm, errors| {
        errors.collect(object::evict_control(
            tpm,
            Hierarchy::Owner,
            &owner_auth,
            object,
            persistent,
        ))
    });
}

pub fn flush_context<O: Opener>(
    opener: &O,
    settings: &Settings,
    args: &FlushContextArgs,
    errors: &mut Errors,
) {
    let Some(handle) = errors.collect(Handle::parse_flag("flush-handle", &args.flush_handle))
    else {
        return;
    };
    with_tpm(opener, settings, errors, |tpm, errors| {
        errors.collect(object::flush_context(tpm, handle))
    });
}
