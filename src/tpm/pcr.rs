use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Number of PCRs addressable by the `--pcr` flag.
pub const PCR_COUNT: u8 = 24;

/// Value of the `--pcr` flag meaning "do not bind to any PCR".
pub const NO_PCR: i32 = -1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PcrError {
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR index `{0}`")]
    InvalidPcrIndex(String),
    #[error("out of range")]
    OutOfRange,
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

/// Hash algorithm of a PCR bank or of a policy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
}

impl HashAlg {
    /// TPM_ALG_ID of the algorithm.
    pub fn alg_id(self) -> u16 {
        match self {
            HashAlg::Sha1 => 0x0004,
            HashAlg::Sha256 => 0x000b,
            HashAlg::Sha384 => 0x000c,
        }
    }

    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
        }
    }
}

impl Default for HashAlg {
    fn default() -> Self {
        HashAlg::Sha256
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HashAlg::Sha1 => "sha1",
            HashAlg::Sha256 => "sha256",
            HashAlg::Sha384 => "sha384",
        })
    }
}

pub fn parse_pcr_bank(bank: &str) -> Result<HashAlg> {
    match bank {
        "sha1" => Ok(HashAlg::Sha1),
        "sha256" => Ok(HashAlg::Sha256),
        "sha384" => Ok(HashAlg::Sha384),
        _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
    }
}

/// Parses the `--pcr` flag.
///
/// Returns `None` for the [`NO_PCR`] sentinel and the PCR index otherwise.
pub fn parse_pcr_index(value: &str) -> Result<Option<u8>> {
    let index: i32 = value
        .trim()
        .parse()
        .map_err(|_| PcrError::InvalidPcrIndex(value.to_string()))?;
    pcr_index(index)
}

/// Range check for an already numeric `--pcr` value.
pub fn pcr_index(index: i32) -> Result<Option<u8>> {
    match index {
        NO_PCR => Ok(None),
        0..=23 => Ok(Some(index as u8)),
        _ => Err(PcrError::OutOfRange),
    }
}

/// A hash bank plus the PCR indices whose current values feed a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrSelection {
    hash: HashAlg,
    pcrs: Vec<u8>,
}

impl PcrSelection {
    pub fn new(hash: HashAlg, pcrs: &[u8]) -> Result<Self> {
        if let Some(bad) = pcrs.iter().find(|&&pcr| pcr >= PCR_COUNT) {
            return Err(PcrError::InvalidPcrIndex(bad.to_string()));
        }
        let mut pcrs = pcrs.to_vec();
        pcrs.sort_unstable();
        pcrs.dedup();
        Ok(Self { hash, pcrs })
    }

    pub fn single(hash: HashAlg, pcr: u8) -> Result<Self> {
        Self::new(hash, &[pcr])
    }

    /// Builds the selection for a `--pcr` value, `None` meaning no binding.
    pub fn from_index(hash: HashAlg, index: Option<u8>) -> Result<Option<Self>> {
        index.map(|pcr| Self::single(hash, pcr)).transpose()
    }

    pub fn hash(&self) -> HashAlg {
        self.hash
    }

    /// Selected indices in ascending order.
    pub fn pcrs(&self) -> &[u8] {
        &self.pcrs
    }

    /// The three-octet `pcrSelect` bitmap of a TPMS_PCR_SELECTION.
    pub fn bitmap(&self) -> [u8; 3] {
        let mut bitmap = [0u8; 3];
        for &pcr in &self.pcrs {
            bitmap[usize::from(pcr / 8)] |= 1 << (pcr % 8);
        }
        bitmap
    }

    /// TPML_PCR_SELECTION holding just this bank.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10);
        out.extend_from_slice(&1u32.to_be_bytes());
        out.extend_from_slice(&self.hash.alg_id().to_be_bytes());
        out.push(3);
        out.extend_from_slice(&self.bitmap());
        out
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pcrs: Vec<String> = self.pcrs.iter().map(u8::to_string).collect();
        write!(f, "{}:{}", self.hash, pcrs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn parse_bad_bank() {
        assert_eq!(
            parse_pcr_bank("bunk"),
            Err(PcrError::InvalidPcrBank("bunk".to_string()))
        );
        assert_eq!(parse_pcr_bank(""), Err(PcrError::InvalidPcrBank("".to_string())));
    }

    #[test]
    fn parse_happy_bank() -> Result<()> {
        assert_eq!(parse_pcr_bank("sha1")?, HashAlg::Sha1);
        assert_eq!(parse_pcr_bank("sha256")?, HashAlg::Sha256);
        assert_eq!(parse_pcr_bank("sha384")?, HashAlg::Sha384);
        Ok(())
    }

    #[test]
    fn parse_sentinel() -> Result<()> {
        assert_eq!(parse_pcr_index("-1")?, None);
        Ok(())
    }

    #[test]
    fn parse_bounds() -> Result<()> {
        assert_eq!(parse_pcr_index("0")?, Some(0));
        assert_eq!(parse_pcr_index("23")?, Some(23));
        assert_eq!(parse_pcr_index("24"), Err(PcrError::OutOfRange));
        assert_eq!(parse_pcr_index("-2"), Err(PcrError::OutOfRange));
        Ok(())
    }

    #[test]
    fn parse_garbage() {
        assert_eq!(
            parse_pcr_index("seven"),
            Err(PcrError::InvalidPcrIndex("seven".to_string()))
        );
        assert_eq!(
            parse_pcr_index(""),
            Err(PcrError::InvalidPcrIndex("".to_string()))
        );
    }

    #[test]
    fn selection_rejects_out_of_range_slot() {
        assert_eq!(
            PcrSelection::new(HashAlg::Sha256, &[1, 24]),
            Err(PcrError::InvalidPcrIndex("24".to_string()))
        );
    }

    #[test]
    fn selection_marshals_bitmap() -> Result<()> {
        let selection = PcrSelection::new(HashAlg::Sha256, &[9, 0, 23, 9])?;
        assert_eq!(selection.pcrs(), &[0, 9, 23]);
        assert_eq!(selection.bitmap(), [0x01, 0x02, 0x80]);
        assert_eq!(
            selection.marshal(),
            vec![0, 0, 0, 1, 0x00, 0x0b, 3, 0x01, 0x02, 0x80]
        );
        assert_eq!(selection.to_string(), "sha256:0,9,23");
        Ok(())
    }

    #[test]
    fn no_selection_for_sentinel() -> Result<()> {
        assert_eq!(PcrSelection::from_index(HashAlg::Sha256, None)?, None);
        assert_eq!(
            PcrSelection::from_index(HashAlg::Sha1, Some(7))?,
            Some(PcrSelection::single(HashAlg::Sha1, 7)?)
        );
        Ok(())
    }
}
