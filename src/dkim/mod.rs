use std::path::Path;

use mail_auth::{
    common::{
        crypto::{RsaKey, Sha256},
        headers::HeaderWriter,
    },
    dkim::DkimSigner,
};

pub struct PrivateKey {
    domain: String,
    selector: String,
    pem: String,
}

const SIGNED_HEADERS: [&str; 26] = [
    "From",
    "Subject",
    "Date",
    "Message-ID",
    "To",
    "Cc",
    "MIME-Version",
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-ID",
    "Content-Description",
    "Resent-Date",
    "Resent-From",
    "Resent-Sender",
    "Resent-To",
    "Resent-Cc",
    "Resent-Message-ID",
    "In-Reply-To",
    "References",
    "List-Id",
    "List-Help",
    "List-Unsubscribe",
    "List-Subscribe",
    "List-Post",
    "List-Owner",
    "List-Archive",
];

impl PrivateKey {
    pub fn load(path: &Path, domain: &str, selector: &str) -> Result<Self, mail_auth::Error> {
        let pem = std::fs::read_to_string(path).map_err(|_| mail_auth::Error::MissingParameters)?;
        // Parse once up front so a malformed key fails at load time, not at first send.
        RsaKey::<Sha256>::from_pkcs8_pem(&pem)?;

        Ok(Self {
            pem,
            domain: domain.to_string(),
            selector: selector.to_string(),
        })
    }

    /// Signs the raw, already-CRLF-normalized message bytes and returns the
    /// `DKIM-Signature` header value, without the leading `DKIM-Signature: ` tag.
    pub fn dkim_header(&self, raw_message: &[u8]) -> Result<String, mail_auth::Error> {
        let sign_key = RsaKey::<Sha256>::from_pkcs8_pem(&self.pem)?;
        let signer = DkimSigner::from_key(sign_key)
            .domain(&self.domain)
            .selector(&self.selector)
            .headers(SIGNED_HEADERS);

        signer.sign(raw_message).map(|signature| {
            signature
                .to_header()
                .trim_start_matches("DKIM-Signature:")
                .trim()
                .to_string()
        })
    }
}
