//! Certificate renewal loop
//!
//! A long-lived task that re-issues the node certificate before it expires
//! and swaps the fresh credentials into the live [`SecurityConfig`]. The
//! renewal instant is drawn uniformly from 50%–80% of the certificate's
//! validity window, so a fleet issued at the same moment spreads its
//! renewals over roughly a third of the window instead of stampeding the
//! CA together.
//!
//! The loop never exits on error: a failed attempt is published on the
//! updates channel and retried on the next tick. Only cancellation ends it,
//! closing the channel.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bootstrap::SecurityConfig;
use crate::ca::{CERT_LOWER_ROTATION_RANGE, CERT_UPPER_ROTATION_RANGE};
use crate::credentials::read_cert_validity;
use crate::error::SecurityError;
use crate::paths::SecurityConfigPaths;
use crate::remote::{CaTransport, Remotes};
use crate::role::MANAGER_ROLE;
use crate::tls;

/// Retry cadence when the certificate's validity cannot be used: parse
/// failures, or a certificate that is already expired (possibly clock skew
/// that will resolve itself)
pub const DEFAULT_RENEWAL_RETRY: Duration = Duration::from_secs(5 * 60);

/// Outcome of one renewal attempt, published on the updates channel
#[derive(Debug)]
pub struct CertificateUpdate {
    /// The node's role after a successful renewal
    pub role: Option<String>,
    /// The failure, when the attempt (or one of its swap steps) failed
    pub err: Option<SecurityError>,
}

impl CertificateUpdate {
    fn renewed(role: String) -> Self {
        CertificateUpdate {
            role: Some(role),
            err: None,
        }
    }

    fn failed(err: SecurityError) -> Self {
        CertificateUpdate {
            role: None,
            err: Some(err),
        }
    }
}

/// Spawn the renewal task for the life of the process.
///
/// Each iteration schedules the next renewal from the on-disk certificate's
/// validity, waits for the timer, a forced-renew signal, or cancellation,
/// then re-runs the issuance path with the current client credentials as
/// authentication (renewals never need a token) and swaps the client,
/// external-CA, and server TLS configurations in that order.
pub fn renew_tls_config(
    cancel: CancellationToken,
    config: Arc<SecurityConfig>,
    base_dir: &Path,
    remotes: Arc<dyn Remotes>,
    transport: Arc<dyn CaTransport>,
    mut renew: mpsc::Receiver<()>,
) -> mpsc::Receiver<CertificateUpdate> {
    let paths = SecurityConfigPaths::new(base_dir);
    let (updates_tx, updates_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            let node_id = config.client_tls_creds().node_id();
            let role = config.client_tls_creds().role();

            let mut retry = DEFAULT_RENEWAL_RETRY;
            match read_cert_validity(&paths.node) {
                Err(e) => {
                    error!(
                        node_id = %node_id,
                        error = %e,
                        path = %paths.node.cert.display(),
                        "failed to read the expiration of the TLS certificate"
                    );
                    let _ = updates_tx
                        .send(CertificateUpdate::failed(
                            SecurityError::invalid_certificate(
                                "failed to read certificate expiration",
                            ),
                        ))
                        .await;
                }
                Ok((valid_from, valid_until)) => {
                    if valid_until < SystemTime::now() {
                        // Possibly temporary clock skew; keep the default cadence.
                        error!(node_id = %node_id, "TLS certificate is expired");
                        let _ = updates_tx
                            .send(CertificateUpdate::failed(SecurityError::CertificateExpired))
                            .await;
                    } else {
                        retry =
                            calculate_random_expiry(valid_from, valid_until, SystemTime::now());
                    }
                }
            }
            debug!(
                node_id = %node_id,
                node_role = %role,
                delay_secs = retry.as_secs(),
                "next certificate renewal scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(retry) => {
                    info!(node_id = %node_id, "renewing certificate");
                }
                Some(_) = renew.recv() => {
                    info!(node_id = %node_id, "forced certificate renewal");
                }
                _ = cancel.cancelled() => {
                    info!(node_id = %node_id, "shutting down certificate renewal routine");
                    return;
                }
            }

            // Renewals don't require a token; the current client
            // credentials authenticate the issuance RPC.
            let root_ca = config.root_ca();
            let key_pair = match root_ca
                .request_and_save_new_certificates(
                    &cancel,
                    &paths.node,
                    "",
                    remotes.as_ref(),
                    transport.as_ref(),
                    Some(config.client_tls_creds().as_ref()),
                    None,
                )
                .await
            {
                Ok(key_pair) => key_pair,
                Err(e) => {
                    error!(node_id = %node_id, error = %e, "failed to renew the certificate");
                    let _ = updates_tx.send(CertificateUpdate::failed(e)).await;
                    continue;
                }
            };

            let client_config = match tls::new_client_tls_config(
                &key_pair,
                root_ca.pool(),
                Some(MANAGER_ROLE),
            ) {
                Ok(c) => c,
                Err(e) => {
                    error!(node_id = %node_id, error = %e, "failed to create a new client config");
                    let _ = updates_tx.send(CertificateUpdate::failed(e)).await;
                    continue;
                }
            };

            match config
                .client_tls_creds()
                .load_new_tls_config(client_config.clone().into())
            {
                Ok(()) => {
                    // The external CA follows the client credentials, but
                    // only once the client swap has actually happened.
                    config
                        .external_ca()
                        .update_tls_config(client_config.without_server_name());
                }
                Err(e) => {
                    error!(node_id = %node_id, error = %e, "failed to update the client credentials");
                    let _ = updates_tx.send(CertificateUpdate::failed(e)).await;
                }
            }

            match tls::new_server_tls_config(&key_pair, root_ca.pool()) {
                Ok(server_config) => {
                    if let Err(e) = config
                        .server_tls_creds()
                        .load_new_tls_config(server_config.into())
                    {
                        error!(node_id = %node_id, error = %e, "failed to update the server TLS credentials");
                        let _ = updates_tx.send(CertificateUpdate::failed(e)).await;
                    }
                }
                Err(e) => {
                    error!(node_id = %node_id, error = %e, "failed to create a new server config");
                    let _ = updates_tx.send(CertificateUpdate::failed(e)).await;
                }
            }

            let _ = updates_tx
                .send(CertificateUpdate::renewed(config.client_tls_creds().role()))
                .await;
        }
    });

    updates_rx
}

/// Pick the next renewal delay: a uniformly random instant between 50% and
/// 80% of the validity window, measured from `valid_from`, clamped to now.
///
/// Degenerate windows (under a minute of spread) collapse to the lower
/// bound deterministically.
pub fn calculate_random_expiry(
    valid_from: SystemTime,
    valid_until: SystemTime,
    now: SystemTime,
) -> Duration {
    let duration = valid_until
        .duration_since(valid_from)
        .unwrap_or(Duration::ZERO);

    let total_minutes = duration.as_secs_f64() / 60.0;
    let min_validity = (total_minutes * CERT_LOWER_ROTATION_RANGE) as i64;
    let max_validity = (total_minutes * CERT_UPPER_ROTATION_RANGE) as i64;

    let random_minutes = if max_validity - min_validity < 1 {
        min_validity
    } else {
        rand::thread_rng().gen_range(min_validity..max_validity)
    };

    let target = valid_from + Duration::from_secs(random_minutes.max(0) as u64 * 60);
    target.duration_since(now).unwrap_or(Duration::ZERO)
}
