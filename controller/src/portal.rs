use std::{
    net::Ipv4Addr,
    sync::mpsc::{self, Receiver, Sender},
    time::Duration,
};

use growlight_common::{ConnectionCredentials, DeviceError, ProvisioningPortal};
use log::{info, warn};

use crate::dns::CaptiveDns;

/// Longer than the control loop needs to persist a record.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Submission {
    pub credentials: ConnectionCredentials,
    pub reply: Sender<bool>,
}

/// Control-loop end of the portal: submissions arrive from HTTP handlers,
/// each handler waits on its own reply channel.
pub struct SubmissionQueue {
    receiver: Receiver<Submission>,
    pending_reply: Option<Sender<bool>>,
}

impl SubmissionQueue {
    pub fn channel() -> (Sender<Submission>, Self) {
        let (sender, receiver) = mpsc::channel();
        (
            sender,
            Self {
                receiver,
                pending_reply: None,
            },
        )
    }

    pub fn poll(&mut self) -> Option<ConnectionCredentials> {
        let submission = self.receiver.try_recv().ok()?;
        self.pending_reply = Some(submission.reply);
        Some(submission.credentials)
    }

    pub fn acknowledge(&mut self, saved: bool) {
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(saved);
        }
    }
}

/// Handler side: hands the credentials to the control loop and blocks until
/// it reports whether they were stored.
pub fn submit(submissions: &Sender<Submission>, credentials: ConnectionCredentials) -> bool {
    let (reply, ack) = mpsc::channel();
    if submissions.send(Submission { credentials, reply }).is_err() {
        return false;
    }
    ack.recv_timeout(ACK_TIMEOUT).unwrap_or(false)
}

/// Portal made of an HTTP server started by `launch` plus an optional
/// wildcard DNS responder. `G` keeps the server alive while provisioning.
pub struct CaptivePortal<F, G> {
    launch: F,
    dns_binding: Option<(Ipv4Addr, u16)>,
    server: Option<G>,
    dns: Option<CaptiveDns>,
    queue: Option<SubmissionQueue>,
}

impl<F, G> CaptivePortal<F, G>
where
    F: FnMut(Sender<Submission>) -> anyhow::Result<G>,
{
    pub fn new(launch: F, dns_binding: Option<(Ipv4Addr, u16)>) -> Self {
        Self {
            launch,
            dns_binding,
            server: None,
            dns: None,
            queue: None,
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.server.is_some()
    }
}

impl<F, G> ProvisioningPortal for CaptivePortal<F, G>
where
    F: FnMut(Sender<Submission>) -> anyhow::Result<G>,
{
    fn open(&mut self) -> Result<(), DeviceError> {
        let (submissions, queue) = SubmissionQueue::channel();
        let server = (self.launch)(submissions).map_err(|err| {
            DeviceError::AccessPointUnavailable(format!("portal server: {err:#}"))
        })?;
        self.server = Some(server);
        self.queue = Some(queue);

        if let Some((answer, port)) = self.dns_binding {
            match CaptiveDns::bind(answer, port) {
                Ok(dns) => {
                    match dns.local_addr() {
                        Ok(local) => info!("captive DNS answering {answer} on {local}"),
                        Err(_) => info!("captive DNS answering {answer} on port {port}"),
                    }
                    self.dns = Some(dns);
                }
                Err(err) => warn!("captive DNS unavailable on port {port}: {err}"),
            }
        }
        Ok(())
    }

    fn service(&mut self) -> Option<ConnectionCredentials> {
        if let Some(dns) = self.dns.as_mut() {
            dns.service();
        }
        self.queue.as_mut()?.poll()
    }

    fn acknowledge(&mut self, result: &Result<(), DeviceError>) {
        if let Some(queue) = self.queue.as_mut() {
            queue.acknowledge(result.is_ok());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn submission_waits_for_acknowledgment() {
        let (sender, slot) = mpsc::channel();
        let mut portal = CaptivePortal::new(
            move |submissions| {
                sender
                    .send(submissions)
                    .map_err(|_| anyhow!("test slot closed"))
            },
            None,
        );
        portal.open().unwrap();
        assert!(portal.is_open());
        let submissions: Sender<Submission> = slot.recv().unwrap();

        let handler = thread::spawn(move || {
            submit(&submissions, ConnectionCredentials::new("garden", "pw"))
        });

        let received = loop {
            if let Some(credentials) = portal.service() {
                break credentials;
            }
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(received, ConnectionCredentials::new("garden", "pw"));

        portal.acknowledge(&Ok(()));
        assert!(handler.join().unwrap());
    }

    #[test]
    fn failed_save_is_reported_to_handler() {
        let (submissions, mut queue) = SubmissionQueue::channel();
        let handler = thread::spawn(move || {
            submit(&submissions, ConnectionCredentials::new("", "pw"))
        });

        let received = loop {
            if let Some(credentials) = queue.poll() {
                break credentials;
            }
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(received.network_name, "");
        queue.acknowledge(false);
        assert!(!handler.join().unwrap());
    }

    #[test]
    fn launch_failure_means_no_access_point() {
        let mut portal =
            CaptivePortal::new(|_| -> anyhow::Result<()> { Err(anyhow!("bind failed")) }, None);
        assert!(matches!(
            portal.open(),
            Err(DeviceError::AccessPointUnavailable(_))
        ));
        assert!(!portal.is_open());
        assert_eq!(portal.service(), None);
    }
}
