use crate::config::SpeakerConfig;
use crate::error::{StageError, StageResult};
use crate::speech::SpeechArtifact;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// A playback target found on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerTarget {
    pub name: String,
    /// Address reported by discovery, if any. Falls back to the name.
    pub address: Option<String>,
    pub model: Option<String>,
}

impl SpeakerTarget {
    pub fn handle(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }
}

#[async_trait]
pub trait Speaker: Send + Sync {
    async fn discover(&self, name: &str) -> StageResult<SpeakerTarget>;
    async fn play(&self, target: &SpeakerTarget, url: &str) -> StageResult<()>;
}

/// Find `target_name` and have it play the artifact. Callers only see
/// success or failure; discovery and playback errors are not told apart.
pub async fn dispatch(speaker: &dyn Speaker, artifact: &SpeechArtifact, target_name: &str) -> StageResult<()> {
    log::info!("Connecting to speaker {}...", target_name);
    let target = speaker.discover(target_name).await?;
    log::info!(
        "Found speaker {} at {} ({})",
        target.name,
        target.handle(),
        target.model.as_deref().unwrap_or("unknown model")
    );

    speaker.play(&target, &artifact.source_url).await?;
    log::info!("Done.");
    Ok(())
}

/// One `<ip> - <friendly name> - <model>` line of `catt scan`. Header and
/// "nothing found" lines yield `None`.
pub fn parse_scan_line(line: &str) -> Option<SpeakerTarget> {
    let (address, rest) = line.trim().split_once(" - ")?;
    address.parse::<std::net::IpAddr>().ok()?;
    let (name, model) = match rest.rsplit_once(" - ") {
        Some((name, model)) => (name, Some(model.trim().to_string())),
        None => (rest, None),
    };
    Some(SpeakerTarget {
        name: name.trim().to_string(),
        address: Some(address.to_string()),
        model,
    })
}

/// Exact, case-sensitive match on the friendly name.
pub fn find_in_scan(output: &str, name: &str) -> Option<SpeakerTarget> {
    output
        .lines()
        .filter_map(parse_scan_line)
        .find(|target| target.name == name)
}

/// Drives a cast-capable command line helper (catt by default).
pub struct CastCli {
    executable: String,
    timeout: Duration,
}

impl CastCli {
    pub fn new(config: &SpeakerConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, String> {
        log::info!("Executing {} {:?}", self.executable, args);

        let child = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn {}: {}", self.executable, e))?;

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| format!("Failed to wait for {}: {}", self.executable, e))?,
            Err(_) => return Err(format!("{} timed out after {:?}", self.executable, self.timeout)),
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(format!(
                "{} exited with {}: {}",
                self.executable,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[async_trait]
impl Speaker for CastCli {
    async fn discover(&self, name: &str) -> StageResult<SpeakerTarget> {
        let stdout = self.run(&["scan"]).await.map_err(StageError::Discovery)?;
        find_in_scan(&stdout, name)
            .ok_or_else(|| StageError::Discovery(format!("no speaker named '{}' on the network", name)))
    }

    async fn play(&self, target: &SpeakerTarget, url: &str) -> StageResult<()> {
        self.run(&["-d", target.handle(), "cast", url])
            .await
            .map(|_| ())
            .map_err(StageError::Playback)
    }
}
