//! The IPC router: accepts connections on the enlistment's pipe and
//! dispatches framed requests.
//!
//! Handlers are serialized per connection (one frame at a time on a
//! stream); connections run concurrently. Everything except
//! `GetStatus` and `Unmount` is refused while the mount is not ready.

use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use phantom_ipc::frame::{read_frame, write_frame};
use phantom_ipc::protocol::{Request, Response};
use phantom_ipc::IpcError;
use phantom_lock::{AcquireOutcome, LockToken};
use phantom_odb::Oid;

use crate::callbacks::VirtualizationSurface;
use crate::maintenance::MaintenanceCommand;
use crate::state::MountState;
use crate::MountContext;

/// Accept loop. Returns when the mount's cancellation token fires.
pub async fn run_listener(
    ctx: Arc<MountContext>,
    surface: Arc<VirtualizationSurface>,
) -> std::io::Result<()> {
    let pipe = ctx.layout.pipe_path();
    // A previous mount of this enlistment may have left its socket.
    let _ = std::fs::remove_file(&pipe);
    let listener = UnixListener::bind(&pipe)?;
    info!(pipe = %pipe.display(), "ipc router listening");

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = ctx.clone();
                    let surface = surface.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(ctx, surface, stream).await {
                            warn!(error = %e, "ipc client handler error");
                        }
                    });
                }
                Err(e) => error!(error = %e, "ipc accept failed"),
            },
        }
    }

    let _ = std::fs::remove_file(&pipe);
    info!("ipc router stopped");
    Ok(())
}

async fn handle_client(
    ctx: Arc<MountContext>,
    surface: Arc<VirtualizationSurface>,
    mut stream: UnixStream,
) -> phantom_ipc::Result<()> {
    debug!("ipc client connected");
    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => match frame {
                Ok(frame) => frame,
                Err(IpcError::Disconnected) => {
                    debug!("ipc client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        let request = match Request::parse(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Never drop a client over a malformed body; answer
                // and keep the connection.
                warn!(error = %e, "malformed ipc request");
                write_frame(&mut stream, &Response::UnknownRequest.render()).await?;
                continue;
            }
        };

        let is_unmount = matches!(request, Request::Unmount);
        let response = dispatch(&ctx, &surface, request).await;
        let granted_unmount = is_unmount && response == Response::Success;
        write_frame(&mut stream, &response.render()).await?;

        if granted_unmount {
            ctx.begin_unmount();
        }
    }
}

/// Routes one request to its handler. Pure with respect to the
/// connection, so it is directly unit-testable.
pub async fn dispatch(
    ctx: &Arc<MountContext>,
    surface: &VirtualizationSurface,
    request: Request,
) -> Response {
    let state = ctx.state.get();
    match (&request, state) {
        (Request::GetStatus, _) | (Request::Unmount, _) => {}
        (Request::AcquireLock(_), MountState::Unmounting) => {
            return Response::UnmountInProgress;
        }
        (_, state) if state != MountState::Ready => return Response::MountNotReady,
        _ => {}
    }

    match request {
        Request::AcquireLock(data) => {
            let token = LockToken {
                pid: data.pid,
                name: data.name,
                args: data.args,
                check_only: data.check_only,
            };
            match ctx.lock.try_acquire_external(token) {
                AcquireOutcome::Granted => Response::Accept,
                AcquireOutcome::DeniedInternal => Response::DenyGvfs,
                AcquireOutcome::DeniedExternal { holder } => Response::DenyGit { holder },
            }
        }

        Request::ReleaseLock(data) => {
            if ctx.lock.release_external(data.pid) {
                // The external command may have rewritten the index;
                // drain what it left us.
                surface.process_deferred();
                Response::Success
            } else {
                Response::Failure
            }
        }

        Request::DownloadObject { oid } => match Oid::from_hex(oid.trim()) {
            Err(_) => Response::InvalidSha,
            Ok(oid) => match ctx.cache.ensure(oid).await {
                Ok(()) => Response::Success,
                Err(e) => {
                    warn!(oid = %oid, error = %e, "download object failed");
                    Response::DownloadFailed
                }
            },
        },

        Request::Prefetch { commits } => {
            if commits.is_empty() || commits.iter().any(|c| Oid::from_hex(c.trim()).is_err()) {
                return Response::InvalidSha;
            }
            match ctx.cache.prefetch(&commits, &ctx.cancel).await {
                Ok(objects) => {
                    info!(commits = commits.len(), objects = objects.len(), "prefetch complete");
                    ctx.maintenance.send(MaintenanceCommand::PostFetch {
                        pack_indexes: Vec::new(),
                    });
                    Response::Success
                }
                Err(e) => {
                    warn!(error = %e, "prefetch failed");
                    Response::DownloadFailed
                }
            }
        }

        Request::GetStatus => Response::Status(ctx.status_payload()),

        Request::ModifiedPaths { version } => {
            if version.trim() == "1" {
                Response::ModifiedPaths {
                    paths: ctx.journal.enumerate(),
                }
            } else {
                Response::InvalidVersion
            }
        }

        Request::PostIndexChanged { flags } => {
            debug!(flags = %flags, "index changed notification");
            ctx.projector.invalidate();
            // Rebuild now if the engine can take an internal hold;
            // otherwise the rebuild happens when the holder releases.
            if let Some(_hold) = ctx.lock.try_hold_internal() {
                if let Err(e) = ctx.projector.refresh_if_stale() {
                    error!(error = %e, "projection rebuild failed");
                    return Response::Failure;
                }
            }
            Response::Success
        }

        Request::RunPostFetchJob { pack_indexes } => {
            ctx.maintenance
                .send(MaintenanceCommand::PostFetch { pack_indexes });
            Response::Success
        }

        Request::Unmount => match state {
            MountState::Ready => Response::Success,
            MountState::Unmounting => Response::UnmountInProgress,
            MountState::Mounting => Response::MountNotReady,
            MountState::MountFailed => Response::Failure,
        },

        Request::Unknown { header } => {
            warn!(header = %header, "unknown ipc request");
            Response::UnknownRequest
        }
    }
}
