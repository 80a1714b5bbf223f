use anyhow::{bail, Context};
use relaycell_agent::{AgentSystem, ChannelResponder, InboundRequest, SharedAudit};
use relaycell_core::types::ImageAttachment;
use relaycell_core::OutboundKind;
use relaycell_storage::AuditLogger;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use super::Env;

fn load_images(paths: &[PathBuf]) -> anyhow::Result<Vec<ImageAttachment>> {
    paths
        .iter()
        .map(|path| {
            let bytes =
                std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?;
            Ok(ImageAttachment::new(ImageAttachment::mime_for_path(path), bytes))
        })
        .collect()
}

/// Start every roster runner, submit one request and print whatever comes
/// back on its channel until a terminal message arrives.
pub async fn run(
    env: &Env,
    agent: &str,
    context: &str,
    from: &str,
    timeout_secs: u64,
    images: &[PathBuf],
    message: &str,
) -> anyhow::Result<()> {
    env.config.validate()?;
    if env.config.profile(agent).is_none() {
        bail!(
            "agent '{}' is not in the roster of {}",
            agent,
            env.config_file.display()
        );
    }

    let store = env.open_store()?;
    let (responder, mut rx) = ChannelResponder::channel(64);
    let mut builder = AgentSystem::builder(env.config.clone(), store, Arc::new(responder))
        .working_dir(env.paths.workspace());
    if env.config.storage.audit_enabled {
        let audit: SharedAudit = Arc::new(Mutex::new(AuditLogger::new(env.paths.clone())));
        builder = builder.audit(audit);
    }
    let system = builder.build();
    system.start()?;

    let handle = format!("cli:{}", uuid::Uuid::new_v4());
    let request = InboundRequest::new(agent, from, &handle, message)
        .with_context(context)
        .with_images(load_images(images)?);
    let task_id = system.submit_request(request).await?;
    info!(task_id = %task_id, agent = %agent, "Waiting for answer");

    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);
    let mut cancelled = false;

    let outcome = loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    break Err(anyhow::anyhow!("responder closed before an answer arrived"));
                };
                if msg.handle != handle {
                    continue;
                }
                match msg.kind {
                    OutboundKind::Notification => eprintln!("… {}", msg.content),
                    OutboundKind::Answer => {
                        println!("{}", msg.content);
                        break Ok(());
                    }
                    OutboundKind::ApprovalRequired => {
                        println!("{}", msg.content);
                        println!("(task {} is waiting for approval)", task_id);
                        break Ok(());
                    }
                    OutboundKind::Cancelled => {
                        eprintln!("{}", msg.content);
                        break Ok(());
                    }
                    OutboundKind::Failure => break Err(anyhow::anyhow!(msg.content)),
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                let affected = system.cancel(&handle).await?;
                eprintln!("Cancelling {} task(s)...", affected);
            }
            _ = &mut deadline => {
                warn!(task_id = %task_id, timeout_secs, "Timed out waiting for answer");
                system.cancel(&handle).await?;
                break Err(anyhow::anyhow!("no answer within {}s", timeout_secs));
            }
        }
    };

    system.shutdown().await;
    outcome
}
