use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

const DOH_ENDPOINT: &str = "https://dns.google/resolve";
const MX_RECORD_TYPE: u16 = 15;

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: i32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// Resolves MX hosts for a domain via Google's DNS-over-HTTPS JSON endpoint, ordered by
/// ascending preference. Any transport or protocol error yields an empty list: "no deliverable
/// MX known" is the caller's cue to abort, not to retry against stdlib DNS.
#[derive(Clone)]
pub struct MxResolver {
    client: reqwest::Client,
    timeout: Duration,
}

impl MxResolver {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub async fn resolve(&self, domain: &str) -> Vec<String> {
        let request = self
            .client
            .get(DOH_ENDPOINT)
            .query(&[
                ("name", domain),
                ("type", "MX"),
                ("ct", "application/x-javascript"),
                ("edns_client_subnet", "0.0.0.0/0"),
                ("cd", "false"),
            ])
            .timeout(self.timeout);

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!("DoH request for {domain} failed: {err}");
                return Vec::new();
            }
        };

        let body: DohResponse = match response.json().await {
            Ok(body) => body,
            Err(err) => {
                warn!("DoH response for {domain} was not valid JSON: {err}");
                return Vec::new();
            }
        };

        if body.status != 0 {
            warn!("DoH resolution for {domain} returned status {}", body.status);
            return Vec::new();
        }

        let mut hosts: Vec<(u32, String)> = body
            .answer
            .into_iter()
            .filter(|a| a.record_type == MX_RECORD_TYPE)
            .map(|a| parse_mx_data(&a.data))
            .collect();

        hosts.sort_by_key(|(preference, _)| *preference);
        hosts.into_iter().map(|(_, host)| host).collect()
    }
}

fn parse_mx_data(data: &str) -> (u32, String) {
    let host = match data.split_once(' ') {
        Some((preference, host)) => {
            let preference = preference.parse().unwrap_or(u32::MAX);
            return (preference, strip_trailing_dot(host));
        }
        None => data,
    };
    (u32::MAX, strip_trailing_dot(host))
}

fn strip_trailing_dot(host: &str) -> String {
    host.strip_suffix('.').unwrap_or(host).to_string()
}
