use k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus;

/// Whether `server_url` is a parseable `https://` URL.
pub fn is_valid_https_url(server_url: &str) -> bool {
    if server_url.is_empty() {
        return false;
    }
    match url::Url::parse(server_url) {
        Ok(u) => u.scheme() == "https",
        Err(_) => false,
    }
}

/// A CSR is terminal once it has been approved or denied.
pub fn is_csr_in_terminal_state(status: &CertificateSigningRequestStatus) -> bool {
    status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
}
