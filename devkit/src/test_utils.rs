/*!
Harness de test côté appareil

Joue le rôle du microcontrôleur en face d'un `DeviceLink`:
- Ouverture automatique sur un `MockPort`
- Envoi de messages appareil (JSON, lignes brutes, octets fragmentés)
- Lecture et filtrage des messages émis par le moniteur
- Attente d'un état de statut donné
*/

use crate::mock_port::MockPort;
use anyhow::{bail, Context, Result};
use medsim_link::{DeviceLink, LinkStatus, StatusSnapshot};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::time::{timeout, Instant};

/// Délai d'attente par défaut
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Appareil simulé branché sur un `DeviceLink` ouvert
pub struct DeviceHarness {
    pub port: MockPort,
    pub link: DeviceLink,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl DeviceHarness {
    /// Lien par défaut sur un port simulé, déjà ouvert
    pub async fn open() -> Result<Self> {
        let port = MockPort::new("mock0");
        let link = DeviceLink::new(Arc::new(port.clone()));
        Self::attach(port, link).await
    }

    /// Ouvre `link` (construit sur `port`) et branche l'appareil
    pub async fn attach(port: MockPort, link: DeviceLink) -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let status = link.open().await.context("Failed to open link")?;
        if status != LinkStatus::Ready {
            bail!("Link did not open: {:?}", status);
        }
        let device = port.take_device().context("Mock port has no device end")?;
        let (reader, writer) = tokio::io::split(device);

        log::info!("🔌 Device harness attached to {}", link.port_name());
        Ok(Self {
            port,
            link,
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Envoie un objet JSON suivi d'un saut de ligne
    pub async fn send_json(&mut self, message: &Value) -> Result<()> {
        let line = serde_json::to_string(message)?;
        self.send_line(&line).await
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.send_raw(line.as_bytes()).await?;
        self.send_raw(b"\n").await
    }

    /// Octets bruts, sans terminaison
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Prochain message émis par le moniteur
    pub async fn next_message(&mut self, wait: Duration) -> Result<Value> {
        let line = timeout(wait, self.lines.next_line())
            .await
            .context("Timeout waiting for a message")??
            .context("Link closed its side of the port")?;
        serde_json::from_str(&line).with_context(|| format!("Invalid JSON from link: {}", line))
    }

    /// Attend un message d'un type donné, en ignorant les autres
    pub async fn wait_for_type(&mut self, kind: &str, wait: Duration) -> Result<Value> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                bail!("Timeout waiting for {}", kind);
            }
            let message = self
                .next_message(remaining)
                .await
                .with_context(|| format!("While waiting for {}", kind))?;
            if message["type"] == kind {
                log::info!("✅ Received expected {}", kind);
                return Ok(message);
            }
        }
    }

    /// Tous les messages reçus pendant `window`
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Value> {
        let deadline = Instant::now() + window;
        let mut messages = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.next_message(remaining).await {
                Ok(message) => messages.push(message),
                Err(_) => break,
            }
        }
        messages
    }

    /// Vérifie que la fin de flux est atteinte (lien fermé côté moniteur)
    pub async fn expect_end_of_stream(&mut self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.lines.next_line()).await {
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(_))) => continue,
                Ok(Err(e)) => bail!("Read error instead of end of stream: {}", e),
                Err(_) => bail!("Timeout waiting for end of stream"),
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        self.link.status()
    }
}

/// Attend que le statut du lien satisfasse `predicate`
pub async fn wait_for_status<F>(link: &DeviceLink, predicate: F, wait: Duration) -> Result<StatusSnapshot>
where
    F: FnMut(&StatusSnapshot) -> bool,
{
    let mut rx = link.subscribe();
    let snapshot = timeout(wait, rx.wait_for(predicate))
        .await
        .with_context(|| format!("Timeout waiting for status, last: {}", link.status()))?
        .context("Status channel closed")?;
    Ok(*snapshot)
}

/// Fabrique les messages émis par l'appareil
pub struct DeviceMessageBuilder;

impl DeviceMessageBuilder {
    pub fn ready() -> Value {
        serde_json::json!({ "type": "READY" })
    }

    pub fn not_ready() -> Value {
        serde_json::json!({ "type": "NOT_READY" })
    }

    pub fn heartbeat() -> Value {
        serde_json::json!({ "type": "HEARTBEAT" })
    }

    pub fn cloud_status<S: Into<String>>(status: S) -> Value {
        serde_json::json!({ "type": "CLOUD_STATUS", "status": status.into() })
    }

    pub fn command<S: Into<String>>(name: S, data: Value) -> Value {
        serde_json::json!({ "type": "COMMAND", "command": name.into(), "data": data })
    }

    pub fn error<S: Into<String>>(detail: S) -> Value {
        serde_json::json!({ "type": "ERROR", "error": detail.into() })
    }
}

/// Accès à un champ imbriqué (`data.temperature.value`)
pub fn field_at<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.get(part))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builders() {
        assert_eq!(DeviceMessageBuilder::ready()["type"], "READY");
        let cmd = DeviceMessageBuilder::command("ALARM", serde_json::json!({"level": "critical"}));
        assert_eq!(cmd["command"], "ALARM");
        assert_eq!(field_at(&cmd, "data.level").unwrap(), "critical");
        assert!(field_at(&cmd, "data.missing").is_none());
    }

    #[tokio::test]
    async fn test_harness_opens_link() {
        let harness = DeviceHarness::open().await.unwrap();
        assert_eq!(harness.status().link, LinkStatus::Ready);
        assert!(harness.port.is_open());
        assert_eq!(harness.port.open_count(), 1);
    }
}
