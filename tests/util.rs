#![allow(dead_code)]

use pki_authority::authority::CertificateAuthority;
use pki_authority::cert::params::{DistinguishedName, Validity};
use pki_authority::config::AuthorityConfig;
use pki_authority::csr::create_csr_pem;
use pki_authority::key::KeyPair;
use pki_authority::model::{Actor, CertificateRecord, Role};

pub fn dn(common_name: &str, organization: &str) -> DistinguishedName {
    DistinguishedName::builder()
        .common_name(common_name.to_string())
        .organization(organization.to_string())
        .country("RS".to_string())
        .build()
}

pub fn admin() -> Actor {
    Actor::new("admin", Role::Admin, Some("Root Org"))
}

pub fn csr_for(common_name: &str, organization: &str, sans: &[&str]) -> String {
    let sans: Vec<String> = sans.iter().map(|s| s.to_string()).collect();
    create_csr_pem(&dn(common_name, organization), &KeyPair::generate_ecdsa_p256(), &sans).unwrap()
}

/// Root (Root Org) -> intermediate (Acme) -> end entity owned by alice.
pub struct Hierarchy {
    pub ca: CertificateAuthority,
    pub root: CertificateRecord,
    pub intermediate: CertificateRecord,
    pub leaf: CertificateRecord,
}

pub fn hierarchy() -> Hierarchy {
    let ca = CertificateAuthority::new(&AuthorityConfig::default());
    let root = ca
        .issue_root(&admin(), dn("Test Root", "Root Org"), Validity::for_days(3650).unwrap(), Default::default())
        .unwrap();
    let intermediate = ca
        .issue_intermediate(
            &admin(),
            root.id,
            dn("Acme Issuing CA", "Acme"),
            Validity::for_days(730).unwrap(),
            Default::default(),
            None,
        )
        .unwrap();
    let alice = Actor::new("alice", Role::Basic, Some("Acme"));
    let leaf = ca
        .issue_end_entity(
            &alice,
            intermediate.id,
            &csr_for("alice.acme.test", "Acme", &["alice.acme.test"]),
            Validity::for_days(90).unwrap(),
            Default::default(),
            None,
        )
        .unwrap();
    Hierarchy {
        ca,
        root,
        intermediate,
        leaf,
    }
}
