//! Human-readable rendering of key entities and verification results.

use std::io::{self, Write};

use chrono::{DateTime, Utc};
use sequoia_openpgp::{
    cert::Cert,
    packet::Signature,
    types::SignatureType,
    KeyHandle, KeyID,
};

use crate::verify::SignerIdentity;

const OPEN_RULE: &str = "=>++++++++++++++++++++++++++++++++++++++++++++++++++";
const CLOSE_RULE: &str = "<=++++++++++++++++++++++++++++++++++++++++++++++++++";

fn type_code(typ: SignatureType) -> &'static str {
    match typ {
        SignatureType::Binary => "sbin ",
        SignatureType::Text => "stext",
        SignatureType::GenericCertification => "sgenc",
        SignatureType::PersonaCertification => "sperc",
        SignatureType::CasualCertification => "scasc",
        SignatureType::PositiveCertification => "sposc",
        SignatureType::SubkeyBinding => "sbind",
        SignatureType::PrimaryKeyBinding => "sprib",
        SignatureType::DirectKey => "sdirc",
        SignatureType::KeyRevocation => "skrev",
        SignatureType::SubkeyRevocation => "sbrev",
        _ => "     ",
    }
}

/// The low 32 bits of a key ID as 8 uppercase hex digits.
fn short_id(keyid: &KeyID) -> String {
    let bytes = keyid.as_bytes();
    hex::encode_upper(&bytes[bytes.len().saturating_sub(4)..])
}

fn write_sig(w: &mut impl Write, sig: &Signature, tag: &str) -> io::Result<()> {
    write!(w, "sig  {} ", type_code(sig.typ()))?;
    if let Some(issuer) = sig.get_issuers().first() {
        let keyid = match issuer {
            KeyHandle::KeyID(id) => id.clone(),
            KeyHandle::Fingerprint(fpr) => KeyID::from(fpr),
        };
        write!(w, "{} ", short_id(&keyid))?;
    }
    if let Some(created) = sig.signature_creation_time() {
        write!(w, "{} ", DateTime::<Utc>::from(created).format("%Y-%m-%d"))?;
    }
    writeln!(w, "--------- --------- {tag}")
}

/// Write the index listing of `cert`: its user IDs, their self-signatures and certifications,
/// revocations and subkey bindings.
pub fn write_entity(w: &mut impl Write, cert: &Cert) -> io::Result<()> {
    writeln!(w, "{OPEN_RULE}")?;

    write!(w, "uid  ")?;
    for ua in cert.userids() {
        w.write_all(ua.userid().value())?;
    }
    writeln!(w)?;

    for ua in cert.userids() {
        for sig in ua.self_signatures() {
            write_sig(w, sig, "[selfsig]")?;
        }
        for sig in ua.certifications() {
            write_sig(w, sig, "---------")?;
        }
    }

    for sig in cert.primary_key().self_revocations() {
        write_sig(w, sig, "---------")?;
    }
    writeln!(w)?;

    let primary = format!("[{}]", short_id(&cert.keyid()));
    for ska in cert.keys().subkeys() {
        for sig in ska.self_signatures() {
            write_sig(w, sig, &primary)?;
        }
    }

    writeln!(w, "{CLOSE_RULE}")
}

/// Report a successful verification.
pub fn write_signer(w: &mut impl Write, identity: &SignerIdentity) -> io::Result<()> {
    writeln!(w, "Authentic and signed by:")?;
    for uid in &identity.user_ids {
        writeln!(w, "\t{uid}")?;
    }
    Ok(())
}
