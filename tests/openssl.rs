mod util;

use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509, X509Crl, X509NameBuilder, X509Req, X509ReqBuilder, X509StoreContext};
use pki_authority::cert::params::Validity;
use pki_authority::model::{Actor, RevocationReason, Role};

fn common_name(name: &openssl::x509::X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string()
}

#[test]
fn test_openssl_verifies_issued_chain() {
    let h = util::hierarchy();
    let root = X509::from_der(&h.root.der).expect("Failed to parse root");
    let intermediate = X509::from_der(&h.intermediate.der).expect("Failed to parse intermediate");
    let leaf = X509::from_der(&h.leaf.der).expect("Failed to parse leaf");

    assert_eq!(common_name(root.subject_name()), "Test Root");
    assert_eq!(common_name(leaf.issuer_name()), "Acme Issuing CA");
    assert_eq!(leaf.version(), 2, "X509 version should be 3 (0-based index)");
    assert_eq!(
        leaf.serial_number().to_bn().unwrap().to_hex_str().unwrap().to_string(),
        h.leaf.serial_number.trim_start_matches('0')
    );
    assert_eq!(
        leaf.subject_alt_names().unwrap().iter().next().unwrap().dnsname(),
        Some("alice.acme.test")
    );

    let mut store = X509StoreBuilder::new().unwrap();
    store.add_cert(root).unwrap();
    let store = store.build();
    let mut chain = Stack::new().unwrap();
    chain.push(intermediate).unwrap();

    let mut context = X509StoreContext::new().unwrap();
    let verified = context
        .init(&store, &leaf, &chain, |c| {
            let ok = c.verify_cert()?;
            assert!(ok, "chain verification failed: {}", c.error());
            Ok(ok)
        })
        .unwrap();
    assert!(verified);
}

#[test]
fn test_openssl_csr_is_accepted() {
    let h = util::hierarchy();

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "bob.acme.test").unwrap();
    name.append_entry_by_text("O", "Acme").unwrap();
    name.append_entry_by_text("C", "RS").unwrap();
    let name = name.build();

    let mut builder = X509ReqBuilder::new().unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    let mut extensions = Stack::new().unwrap();
    extensions
        .push(
            SubjectAlternativeName::new()
                .dns("bob.acme.test")
                .build(&builder.x509v3_context(None))
                .unwrap(),
        )
        .unwrap();
    builder.add_extensions(&extensions).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let csr_pem = String::from_utf8(builder.build().to_pem().unwrap()).unwrap();

    let bob = Actor::new("bob", Role::Basic, Some("Acme"));
    let record = h
        .ca
        .issue_end_entity(&bob, h.intermediate.id, &csr_pem, Validity::for_days(30).unwrap(), Default::default(), None)
        .unwrap();
    assert_eq!(record.subject.common_name, "bob.acme.test");
    assert_eq!(record.subject_alt_names, vec!["bob.acme.test".to_string()]);

    let issued = X509::from_der(&record.der).unwrap();
    assert!(issued.public_key().unwrap().public_eq(&key));
    let intermediate = X509::from_der(&h.intermediate.der).unwrap();
    assert!(issued.verify(&intermediate.public_key().unwrap()).unwrap());
}

#[test]
fn test_openssl_parses_generated_csr() {
    let csr_pem = util::csr_for("carol.acme.test", "Acme", &["carol.acme.test"]);
    let csr = X509Req::from_pem(csr_pem.as_bytes()).expect("Failed to parse CSR");
    assert!(csr.verify(&csr.public_key().unwrap()).unwrap());
    assert_eq!(common_name(csr.subject_name()), "carol.acme.test");
}

#[test]
fn test_openssl_parses_crl() {
    let h = util::hierarchy();
    h.ca
        .revoke(&util::admin(), h.leaf.id, RevocationReason::KeyCompromise)
        .unwrap();
    let crl = h.ca.crl(&h.intermediate.serial_number).unwrap();

    let parsed = X509Crl::from_der(&crl.to_der().unwrap()).expect("Failed to parse CRL");
    let intermediate = X509::from_der(&h.intermediate.der).unwrap();
    assert!(parsed.verify(&intermediate.public_key().unwrap()).unwrap());
    assert_eq!(common_name(parsed.issuer_name()), "Acme Issuing CA");
    assert!(parsed.next_update().is_some());

    let revoked = parsed.get_revoked().expect("CRL should list revocations");
    assert_eq!(revoked.len(), 1);
    let serial = revoked
        .iter()
        .next()
        .unwrap()
        .serial_number()
        .to_bn()
        .unwrap()
        .to_hex_str()
        .unwrap()
        .to_string();
    assert_eq!(serial, h.leaf.serial_number.trim_start_matches('0'));
}
