use crate::error::{CaError, Result};

pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";
pub const CRL_LABEL: &str = "X509 CRL";
pub const CSR_LABELS: [&str; 2] = ["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Convert DER‑encoded data into a PEM‑encoded string with the provided label.
pub fn der_to_pem(der: &[u8], label: &str) -> String {
    let pem = pem::Pem::new(label, der);
    pem::encode_config(
        &pem,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// Convert a PEM‑encoded string to DER‑encoded bytes, accepting only the
/// given labels.
pub fn pem_to_der(pem_str: &str, labels: &[&str]) -> Result<Vec<u8>> {
    let pem = pem::parse(pem_str.trim())?;
    if !labels.contains(&pem.tag()) {
        return Err(CaError::Encoding(format!(
            "unexpected PEM label '{}'",
            pem.tag()
        )));
    }
    Ok(pem.contents().to_vec())
}

/// Serde adapter storing certificate DER as a PEM string.
pub mod certificate_pem {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{CERTIFICATE_LABEL, der_to_pem, pem_to_der};

    pub fn serialize<S: Serializer>(der: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&der_to_pem(der, CERTIFICATE_LABEL))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let pem = String::deserialize(deserializer)?;
        pem_to_der(&pem, &[CERTIFICATE_LABEL]).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_is_checked() {
        let pem = der_to_pem(&[0x30, 0x00], CRL_LABEL);
        assert!(pem.starts_with("-----BEGIN X509 CRL-----\n"));
        assert_eq!(pem_to_der(&pem, &[CRL_LABEL]).unwrap(), vec![0x30, 0x00]);
        assert!(pem_to_der(&pem, &CSR_LABELS).is_err());
    }
}
