//! Gateway reachability probe.
//!
//! Brings a tunnel up in-process, pings the configured targets through it,
//! measures one bulk download, and reports the lot as a structured record.
//! Per-target failures are absorbed; only bootstrap failures end the run.

use std::time::Duration;

use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::download::{choose_download_url, download_file};
use crate::logging::TunnelLogger;
use crate::ping::send_ping;
use crate::registry::{close_net_tunnel, open_net_tunnel, DEVICES, DEFAULT_MTU};
use crate::sockets::IpVersion;

/// Pause between echo attempts towards IP targets, to stay under ICMP rate
/// limits. Hostname targets are not throttled.
const INTER_IP_PING_DELAY: Duration = Duration::from_secs(5);

/// Probe parameters, as delivered across the boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub wg_ip: String,
    pub dns: String,
    pub private_key: String,
    pub public_key: String,
    pub endpoint: String,
    /// Extra IPC lines, passed through verbatim with `\n` escapes expanded.
    #[serde(default)]
    pub awg_args: String,
    #[serde(default)]
    pub ping_hosts: Vec<String>,
    #[serde(default)]
    pub ping_ips: Vec<String>,
    pub num_ping: u8,
    pub send_timeout_sec: u64,
    pub recv_timeout_sec: u64,
    pub download_timeout_sec: u64,
    pub ip_version: u8,
}

/// Probe report. Counters never decrease and `received_* <= sent_*`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub can_handshake: bool,
    pub sent_ips: u16,
    pub received_ips: u16,
    pub sent_hosts: u16,
    pub received_hosts: u16,
    pub can_resolve_dns: bool,
    pub downloaded_file: String,
    pub download_duration_sec: u64,
    pub download_error: String,
}

/// Probe runner. The URL seed and the inter-ping delay are seams for
/// tests; defaults match production behaviour.
pub struct Prober {
    url_seed: Option<u64>,
    inter_ip_ping_delay: Duration,
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober {
    pub fn new() -> Self {
        Prober {
            url_seed: None,
            inter_ip_ping_delay: INTER_IP_PING_DELAY,
        }
    }

    /// Pin the download URL selection.
    pub fn with_url_seed(mut self, seed: u64) -> Self {
        self.url_seed = Some(seed);
        self
    }

    /// Override the pause between IP-target echoes.
    pub fn with_inter_ip_ping_delay(mut self, delay: Duration) -> Self {
        self.inter_ip_ping_delay = delay;
        self
    }

    /// Run the probe end to end:
    /// bootstrap -> host pings -> IP pings -> download.
    pub fn run(&self, request: &ProbeRequest) -> ProbeResponse {
        let mut response = ProbeResponse::default();
        let logger = TunnelLogger::new("probe");

        let version = match IpVersion::from_u8(request.ip_version) {
            Ok(version) => version,
            Err(e) => {
                response.download_error = e.to_string();
                return response;
            }
        };

        // Picked up front so the response names the URL on every path.
        let mut rng = match self.url_seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_entropy(),
        };
        let url = choose_download_url(version, &mut rng);
        response.downloaded_file = url.to_string();

        let settings = assemble_ipc(request, version);
        let handle = match open_net_tunnel(
            &request.wg_ip,
            &request.dns,
            DEFAULT_MTU,
            &settings,
            logger.clone(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                logger.error(format!("bootstrap failed: {e}"));
                response.download_error = format!("tunnel bootstrap failed: {e}");
                return response;
            }
        };
        response.can_handshake = true;

        let Some(session) = DEVICES.get(handle) else {
            response.download_error = "device vanished during probe".into();
            return response;
        };
        let tunnel = session.tunnel.clone();

        let send_timeout = Duration::from_secs(request.send_timeout_sec);
        let recv_timeout = Duration::from_secs(request.recv_timeout_sec);

        for host in &request.ping_hosts {
            for seq in 0..request.num_ping {
                logger.info(format!("pinging {host} seq={seq}"));
                response.sent_hosts = response.sent_hosts.saturating_add(1);
                match send_ping(&tunnel, host, seq as u16, send_timeout, recv_timeout, version) {
                    Ok(rtt) => {
                        response.received_hosts = response.received_hosts.saturating_add(1);
                        response.can_resolve_dns = true;
                        logger.info(format!("ping latency: {rtt:?}"));
                    }
                    Err(e) => logger.error(format!("failed to ping {host}: {e}")),
                }
            }
        }

        for ip in &request.ping_ips {
            for seq in 0..request.num_ping {
                logger.info(format!("pinging {ip} seq={seq}"));
                response.sent_ips = response.sent_ips.saturating_add(1);
                match send_ping(&tunnel, ip, seq as u16, send_timeout, recv_timeout, version) {
                    Ok(rtt) => {
                        response.received_ips = response.received_ips.saturating_add(1);
                        logger.info(format!("ping latency: {rtt:?}"));
                    }
                    Err(e) => logger.error(format!("failed to ping {ip}: {e}")),
                }
                std::thread::sleep(self.inter_ip_ping_delay);
            }
        }

        match download_file(
            &tunnel,
            url,
            Duration::from_secs(request.download_timeout_sec),
            version,
        ) {
            Ok((bytes, elapsed)) => {
                logger.info(format!(
                    "downloaded {:.2} MB in {elapsed:?}",
                    bytes as f64 / 1024.0 / 1024.0
                ));
                response.download_duration_sec = elapsed.as_secs();
            }
            Err(e) => {
                logger.error(format!("failed to download file: {e}"));
                response.download_error = e.to_string();
            }
        }

        close_net_tunnel(handle);
        response
    }
}

/// Assemble the IPC block for the probe device. `awg_args` lines are
/// spliced in between the private and public key, with literal `\n`
/// escapes expanded.
fn assemble_ipc(request: &ProbeRequest, version: IpVersion) -> String {
    let mut ipc = String::new();
    ipc.push_str("private_key=");
    ipc.push_str(&request.private_key);
    if !request.awg_args.is_empty() {
        ipc.push('\n');
        ipc.push_str(&request.awg_args.replace("\\n", "\n"));
    }
    ipc.push_str("\npublic_key=");
    ipc.push_str(&request.public_key);
    ipc.push_str("\nendpoint=");
    ipc.push_str(&request.endpoint);
    match version {
        IpVersion::V4 => ipc.push_str("\nallowed_ip=0.0.0.0/0\n"),
        IpVersion::V6 => ipc.push_str("\nallowed_ip=::/0\n"),
    }
    ipc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DOWNLOAD_URLS_V4, DOWNLOAD_URLS_V6};
    use crate::ipc::{derive_public_key, encode_key_hex, generate_private_key};

    fn request(wg_ip: &str, ip_version: u8) -> ProbeRequest {
        let private_key = generate_private_key().unwrap();
        let public_key = derive_public_key(&generate_private_key().unwrap());
        ProbeRequest {
            wg_ip: wg_ip.to_string(),
            dns: "1.1.1.1".to_string(),
            private_key: encode_key_hex(&private_key),
            public_key: encode_key_hex(&public_key),
            endpoint: "127.0.0.1:9".to_string(),
            awg_args: String::new(),
            ping_hosts: vec![],
            ping_ips: vec![],
            num_ping: 0,
            send_timeout_sec: 1,
            recv_timeout_sec: 1,
            download_timeout_sec: 1,
            ip_version,
        }
    }

    #[test]
    fn ipc_assembly_matches_grammar() {
        let mut req = request("10.0.0.2", 4);
        req.awg_args = "jc=4\\njmin=40".to_string();
        let ipc = assemble_ipc(&req, IpVersion::V4);
        let expected = format!(
            "private_key={}\njc=4\njmin=40\npublic_key={}\nendpoint=127.0.0.1:9\nallowed_ip=0.0.0.0/0\n",
            req.private_key, req.public_key
        );
        assert_eq!(ipc, expected);

        let ipc6 = assemble_ipc(&request("fd00::2", 6), IpVersion::V6);
        assert!(ipc6.ends_with("allowed_ip=::/0\n"));
    }

    #[test]
    fn bootstrap_failure_is_terminal_with_zero_counters() {
        let req = request("not an ip", 4);
        let response = Prober::new().with_url_seed(1).run(&req);
        assert!(!response.can_handshake);
        assert_eq!(response.sent_ips, 0);
        assert_eq!(response.sent_hosts, 0);
        assert_eq!(response.received_ips, 0);
        assert_eq!(response.received_hosts, 0);
        assert!(!response.can_resolve_dns);
        assert!(!response.download_error.is_empty());
        // The URL is still recorded.
        assert!(DOWNLOAD_URLS_V4.contains(&response.downloaded_file.as_str()));
    }

    #[test]
    fn invalid_ip_version_is_rejected() {
        let req = request("10.0.0.2", 5);
        let response = Prober::new().run(&req);
        assert!(!response.can_handshake);
        assert!(response.download_error.contains("ip_version"));
    }

    #[test]
    fn seeded_url_pick_is_stable_across_runs() {
        let req4 = request("not an ip", 4);
        let first = Prober::new().with_url_seed(42).run(&req4);
        let second = Prober::new().with_url_seed(42).run(&req4);
        assert_eq!(first.downloaded_file, second.downloaded_file);

        let req6 = request("not an ip", 6);
        let v6 = Prober::new().with_url_seed(42).run(&req6);
        assert!(DOWNLOAD_URLS_V6.contains(&v6.downloaded_file.as_str()));
    }

    #[test]
    fn num_ping_zero_sends_nothing_but_still_downloads() {
        // A device that comes up against an unreachable peer: handshake
        // state is reached ("up" without error), no echoes are sent, and
        // the download fails with a recorded error.
        let mut req = request("10.0.0.2", 4);
        req.ping_hosts = vec!["192.0.2.10".to_string()];
        req.ping_ips = vec!["192.0.2.11".to_string()];
        req.num_ping = 0;

        let response = Prober::new()
            .with_url_seed(3)
            .with_inter_ip_ping_delay(Duration::from_millis(1))
            .run(&req);

        assert!(response.can_handshake);
        assert_eq!(response.sent_hosts, 0);
        assert_eq!(response.sent_ips, 0);
        assert!(!response.can_resolve_dns);
        assert!(!response.download_error.is_empty());
        assert!(!response.downloaded_file.is_empty());
    }

    #[test]
    fn response_schema_round_trips_as_json() {
        let response = ProbeResponse {
            can_handshake: true,
            sent_ips: 2,
            received_ips: 2,
            sent_hosts: 2,
            received_hosts: 1,
            can_resolve_dns: true,
            downloaded_file: "https://example.com/f.bin".into(),
            download_duration_sec: 12,
            download_error: String::new(),
        };
        let json = serde_json::to_string(&response).unwrap();
        let back: ProbeResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, response);
    }
}
