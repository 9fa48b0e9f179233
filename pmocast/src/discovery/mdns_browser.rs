//! mDNS browser backed by the `mdns` crate.
//!
//! The `mdns` discovery stream runs on async-std; each browse gets its own
//! thread which drives the stream for the collection window and forwards the
//! parsed responses through a channel.

use std::collections::HashMap;
use std::net::IpAddr;
use std::thread;
use std::time::Duration;

use futures::StreamExt;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use tracing::{debug, warn};

use crate::discovery::{ServiceBrowser, ServiceResponse};
use crate::errors::CastError;

/// Upper bound between two queries of the same browse.
const MAX_QUERY_INTERVAL: Duration = Duration::from_secs(1);
const MIN_QUERY_INTERVAL: Duration = Duration::from_millis(10);

/// Interval handed to `mdns::discover`. The first query only goes out after
/// one interval, so it must fire well inside the collection window.
fn query_interval(window: Duration) -> Duration {
    (window / 3).clamp(MIN_QUERY_INTERVAL, MAX_QUERY_INTERVAL)
}

#[derive(Clone, Debug, Default)]
pub struct MdnsBrowser;

impl MdnsBrowser {
    pub fn new() -> Self {
        Self
    }
}

impl ServiceBrowser for MdnsBrowser {
    fn browse(
        &self,
        service_type: &str,
        window: Duration,
    ) -> Result<BoxStream<'static, ServiceResponse>, CastError> {
        let (tx, rx) = mpsc::unbounded::<ServiceResponse>();
        let service_type = service_type.to_string();
        let interval = query_interval(window);

        thread::Builder::new()
            .name("cast-mdns-browse".into())
            .spawn(move || {
                async_std::task::block_on(async move {
                    let discovery = match mdns::discover::all(&service_type, interval) {
                        Ok(discovery) => discovery,
                        Err(err) => {
                            warn!(error = ?err, service = %service_type, "Cannot start mDNS query");
                            return;
                        }
                    };

                    let stream = discovery.listen();
                    futures::pin_mut!(stream);

                    let collect = async {
                        while let Some(item) = stream.next().await {
                            match item {
                                Ok(response) => {
                                    if let Some(parsed) =
                                        service_response_from_mdns(&response, &service_type)
                                    {
                                        if tx.unbounded_send(parsed).is_err() {
                                            break;
                                        }
                                    }
                                }
                                Err(err) => debug!(error = ?err, "Ignoring mDNS read error"),
                            }
                        }
                    };

                    // The window is a hard limit: the thread ends with it.
                    let _ = async_std::future::timeout(window, collect).await;
                });
            })
            .map_err(|err| CastError::Discovery(err.to_string()))?;

        Ok(rx.boxed())
    }
}

/// Extracts the service instance, address and TXT entries from an mDNS
/// response to a `service_type` query.
fn service_response_from_mdns(
    response: &mdns::Response,
    service_type: &str,
) -> Option<ServiceResponse> {
    let (fullname, ttl) = response.records().find_map(|r| match r.kind {
        mdns::RecordKind::PTR(ref name) if name.ends_with(service_type) => {
            Some((name.clone(), r.ttl))
        }
        _ => None,
    })?;

    let addresses: Vec<IpAddr> = response
        .records()
        .filter_map(|r| match r.kind {
            mdns::RecordKind::A(addr) => Some(IpAddr::V4(addr)),
            mdns::RecordKind::AAAA(addr) => Some(IpAddr::V6(addr)),
            _ => None,
        })
        .collect();

    // Prefer IPv4 addresses
    let host = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.first())
        .map(|addr| addr.to_string());

    let port = response.records().find_map(|r| match r.kind {
        mdns::RecordKind::SRV { port, .. } => Some(port),
        _ => None,
    });

    let txt: Vec<String> = response
        .records()
        .filter_map(|r| match r.kind {
            mdns::RecordKind::TXT(ref data) => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();

    debug!(
        fullname = %fullname,
        ttl,
        host = ?host,
        port = ?port,
        txt = ?txt_summary(&txt),
        "mDNS answer"
    );

    Some(ServiceResponse {
        fullname,
        host,
        port,
        txt,
        goodbye: ttl == 0,
    })
}

fn txt_summary(txt: &[String]) -> HashMap<&str, &str> {
    txt.iter()
        .filter_map(|entry| entry.split_once('='))
        .collect()
}
