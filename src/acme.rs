//! ACME (Let's Encrypt) certificate issuance over HTTP-01

use crate::certificate::{CertificateIssuer, ChallengeRegistry, IssuedCertificate};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    Order, OrderStatus,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Time allowed for the authority to validate the challenges
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Time allowed for the certificate to be issued after finalization
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Let's Encrypt production directory
pub fn default_directory_url() -> &'static str {
    LetsEncrypt::Production.url()
}

/// Issues certificates from an ACME directory.
///
/// A new account is registered for every issuance; no account state is kept.
#[derive(Debug, Clone)]
pub struct AcmeIssuer {
    directory_url: String,
    email: String,
}

impl AcmeIssuer {
    pub fn new(directory_url: impl Into<String>, email: impl Into<String>) -> Self {
        // The ACME HTTP client builds its TLS config from the process default
        crate::tls::install_crypto_provider();
        Self {
            directory_url: directory_url.into(),
            email: email.into(),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn create_account(&self, domain: &str) -> Result<Account> {
        let contact = format!("mailto:{}", self.email);
        let (account, _credentials) = Account::builder()
            .map_err(|e| GatewayError::issuance(domain, e))?
            .create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await
            .map_err(|e| GatewayError::issuance(domain, format!("account creation: {}", e)))?;

        debug!(domain = %domain, directory = %self.directory_url, "ACME account created");
        Ok(account)
    }

    /// Poll the order until every authorization is validated
    async fn wait_until_ready(&self, domain: &str, order: &mut Order) -> Result<()> {
        let deadline = Instant::now() + CHALLENGE_TIMEOUT;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| GatewayError::issuance(domain, format!("order refresh: {}", e)))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(GatewayError::issuance(domain, "challenge validation failed"));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if Instant::now() > deadline {
                        return Err(GatewayError::issuance(
                            domain,
                            "timed out waiting for challenge validation",
                        ));
                    }
                    trace!(domain = %domain, status = ?state.status, "Order not ready yet");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Submit a CSR and wait for the certificate chain.
    /// Returns (private key PEM, certificate chain PEM).
    async fn finalize(&self, domain: &str, order: &mut Order) -> Result<(String, String)> {
        let key_pair = rcgen::KeyPair::generate().map_err(|e| GatewayError::issuance(domain, e))?;
        let params = rcgen::CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| GatewayError::issuance(domain, e))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| GatewayError::issuance(domain, format!("CSR: {}", e)))?
            .der()
            .to_vec();

        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| GatewayError::issuance(domain, format!("finalization: {}", e)))?;

        let deadline = Instant::now() + ISSUANCE_TIMEOUT;
        let chain = loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| GatewayError::issuance(domain, format!("order refresh: {}", e)))?;

            match state.status {
                OrderStatus::Valid => {
                    let chain = order
                        .certificate()
                        .await
                        .map_err(|e| GatewayError::issuance(domain, e))?;
                    break chain
                        .ok_or_else(|| GatewayError::issuance(domain, "no certificate in response"))?;
                }
                OrderStatus::Invalid => {
                    return Err(GatewayError::issuance(domain, "order became invalid"));
                }
                _ => {
                    if Instant::now() > deadline {
                        return Err(GatewayError::issuance(domain, "timed out waiting for certificate"));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        Ok((key_pair.serialize_pem(), chain))
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, domain: &str, challenges: &ChallengeRegistry) -> Result<IssuedCertificate> {
        info!(domain = %domain, "Requesting certificate from ACME directory");

        let account = self.create_account(domain).await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| GatewayError::issuance(domain, format!("order creation: {}", e)))?;

        // Responses stay answerable until validation completed or failed
        let mut pending = Vec::new();
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz =
                    result.map_err(|e| GatewayError::issuance(domain, format!("authorization: {}", e)))?;

                if authz.status == AuthorizationStatus::Valid {
                    debug!(domain = %domain, "Authorization already valid");
                    continue;
                }

                let mut challenge = authz
                    .challenge(ChallengeType::Http01)
                    .ok_or_else(|| GatewayError::issuance(domain, "no HTTP-01 challenge offered"))?;

                let key_authorization = challenge.key_authorization();
                pending.push(challenges.register(&challenge.token, key_authorization.as_str()));

                challenge
                    .set_ready()
                    .await
                    .map_err(|e| GatewayError::issuance(domain, format!("challenge: {}", e)))?;
            }
        }

        self.wait_until_ready(domain, &mut order).await?;
        drop(pending);

        let (private_key_pem, certificate_pem) = self.finalize(domain, &mut order).await?;
        info!(domain = %domain, "Certificate issued");

        Ok(IssuedCertificate {
            private_key_pem,
            certificate_pem,
        })
    }
}
