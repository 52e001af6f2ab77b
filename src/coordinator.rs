//! Runs one request end to end: body, environment, process, output.
//!
//! After spawning, a supervisor task owns the process. It relays stdout to
//! the client, feeds stdin and drains stderr from tasks of their own so no
//! ordering of script reads and writes can block the pipes, and reaps the
//! child on every path out.

use crate::{
    body::{BodyTransfer, PreparedBody},
    config::Config,
    env::{EnvironmentBuilder, ServerMeta},
    error::{error_response, CgiError},
    process::{drain_stderr, feed, ProcessRunner, ScriptProcess},
    request::CgiRequest,
    response::{CgiHead, HeadParser},
    router::ScriptTarget,
};
use bytes::Bytes;
use futures::stream::StreamExt;
use hyper::{Body, Response};
use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    process::ChildStdout,
    sync::{oneshot, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::io::ReaderStream;

type Reply = oneshot::Sender<Result<Response<Body>, CgiError>>;

/// Counts live scripts; decremented when the supervisor lets go.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Where the response stands.
enum Outlet {
    /// Nothing sent yet; the handler is waiting on the reply.
    Pending(Reply),
    /// Headers are out, body bytes go here. `gone` resolves once the client
    /// drops the body.
    Streaming {
        sender: hyper::body::Sender,
        gone: oneshot::Receiver<()>,
    },
    Closed,
}

impl Outlet {
    fn respond(&mut self, res: Result<Response<Body>, CgiError>) -> Result<(), CgiError> {
        match std::mem::replace(self, Outlet::Closed) {
            Outlet::Pending(reply) => reply.send(res).map_err(|_| CgiError::ClientGone),
            _ => Ok(()),
        }
    }

    /// Sends the head with a streaming body and switches to streaming.
    fn start(&mut self, head: CgiHead) -> Result<(), CgiError> {
        let (sender, body) = Body::channel();
        let (watch, gone) = oneshot::channel::<()>();
        let body = body.map(move |chunk| {
            let _watch = &watch;
            chunk
        });
        self.respond(Ok(head.into_response(Body::wrap_stream(body))))?;
        *self = Outlet::Streaming { sender, gone };
        Ok(())
    }

    async fn send(&mut self, chunk: Bytes) -> Result<(), CgiError> {
        if chunk.is_empty() {
            return Ok(());
        }
        match self {
            Outlet::Streaming { sender, .. } => sender
                .send_data(chunk)
                .await
                .map_err(|_| CgiError::ClientGone),
            _ => Err(CgiError::ClientGone),
        }
    }

    /// Before headers: an error page. After: the body is cut off.
    fn fail(&mut self, err: CgiError) {
        match std::mem::replace(self, Outlet::Closed) {
            Outlet::Pending(reply) => {
                let _ = reply.send(Err(err));
            }
            Outlet::Streaming { sender, .. } => {
                error!("aborting response already in flight: {}", err);
                sender.abort();
            }
            Outlet::Closed => {}
        }
    }

    async fn closed(&mut self) {
        match self {
            Outlet::Pending(reply) => reply.closed().await,
            Outlet::Streaming { gone, .. } => {
                let _ = gone.await;
            }
            Outlet::Closed => futures::future::pending().await,
        }
    }
}

/// How stdout ended.
enum Relayed {
    /// Headers went out and the body followed until EOF.
    Streamed,
    /// EOF came before any blank line; the exit status decides what to do.
    Unterminated(HeadParser),
}

struct Pipeline {
    process: ScriptProcess,
    script: String,
    deadline: Instant,
    grace: Duration,
    outlet: Outlet,
    _permit: Option<OwnedSemaphorePermit>,
    _active: ActiveGuard,
}

impl Pipeline {
    async fn run(mut self, body: PreparedBody) {
        let (stdin, stdout, stderr) = match self.process.take_pipes() {
            Ok(pipes) => pipes,
            Err(err) => {
                self.outlet.fail(err);
                self.process.finish(self.grace).await;
                return;
            }
        };

        let mut feeder: JoinHandle<Result<u64, CgiError>> = tokio::spawn(feed(stdin, body.stream));
        let mut stderr_task = tokio::spawn(drain_stderr(stderr, self.script.clone(), self.process.pid()));

        let relayed = match time::timeout_at(self.deadline, self.relay(stdout, &mut feeder)).await {
            Ok(result) => result,
            Err(_) => Err(CgiError::Timeout(self.process.elapsed())),
        };

        let outcome = match relayed {
            Ok(Relayed::Streamed) => {
                // Stdout is closed, so the body is complete whatever the
                // process does next.
                self.outlet = Outlet::Closed;
                match self.process.wait_until(self.deadline, self.grace).await {
                    Ok(status) if !status.success() => {
                        warn!("{} exited with {} after its response started", self.script, status);
                        Ok(())
                    }
                    Ok(_) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Ok(Relayed::Unterminated(parser)) => {
                match self.process.wait_until(self.deadline, self.grace).await {
                    Ok(status) if !status.success() => Err(CgiError::ScriptFailed(status)),
                    Ok(_) if parser.is_empty() => Err(CgiError::EmptyResponse),
                    Ok(_) => {
                        let (head, data) = parser.into_unterminated();
                        self.outlet.respond(Ok(head.into_response(Body::from(data))))
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => self.outlet = Outlet::Closed,
            Err(CgiError::ClientGone) => {
                debug!("client left while {} was running", self.script);
                self.outlet = Outlet::Closed;
            }
            Err(err) => {
                warn!("{} failed: {}", self.script, err);
                self.outlet.fail(err);
            }
        }

        feeder.abort();
        self.process.finish(self.grace).await;
        if time::timeout(self.grace, &mut stderr_task).await.is_err() {
            debug!("stderr of {} still open after exit", self.script);
            stderr_task.abort();
        }
        info!(
            "{} finished as {:?} in {:?}",
            self.script,
            self.process.state(),
            self.process.elapsed()
        );
    }

    /// Reads stdout until EOF: head first, then the body, streamed as it
    /// comes.
    async fn relay(
        &mut self,
        stdout: ChildStdout,
        feeder: &mut JoinHandle<Result<u64, CgiError>>,
    ) -> Result<Relayed, CgiError> {
        let mut output = ReaderStream::new(stdout);
        let mut parser = HeadParser::new();
        let mut fed = false;

        let (declared, rest) = loop {
            tokio::select! {
                read = output.next() => match read {
                    Some(chunk) => {
                        if let Some((head, rest)) = parser.push(&chunk?)? {
                            debug!("{} answered {}", self.script, head.status);
                            let declared = head.content_length;
                            self.outlet.start(head)?;
                            break (declared, rest);
                        }
                    }
                    None => return Ok(Relayed::Unterminated(parser)),
                },
                joined = &mut *feeder, if !fed => {
                    fed = true;
                    check_feed(joined)?;
                },
                _ = self.outlet.closed() => return Err(CgiError::ClientGone),
            }
        };

        let mut relayed = rest.len() as u64;
        self.outlet.send(rest).await?;
        loop {
            tokio::select! {
                read = output.next() => match read {
                    Some(chunk) => {
                        let chunk = chunk?;
                        relayed += chunk.len() as u64;
                        self.outlet.send(chunk).await?;
                    }
                    None => break,
                },
                _ = self.outlet.closed() => return Err(CgiError::ClientGone),
            }
        }

        match declared {
            Some(len) if len != relayed => warn!(
                "{} declared Content-Length {} but wrote {} bytes",
                self.script, len, relayed
            ),
            _ => {}
        }
        Ok(Relayed::Streamed)
    }
}

fn check_feed(joined: Result<Result<u64, CgiError>, tokio::task::JoinError>) -> Result<(), CgiError> {
    match joined {
        Ok(Ok(written)) => {
            debug!("fed {} bytes to script", written);
            Ok(())
        }
        Ok(Err(err @ CgiError::MalformedBody(_))) | Ok(Err(err @ CgiError::BodyTooLarge { .. })) => {
            Err(err)
        }
        Ok(Err(err)) => {
            warn!("writing request body to script failed: {}", err);
            Ok(())
        }
        Err(err) => {
            warn!("stdin task died: {}", err);
            Ok(())
        }
    }
}

/// Drives CGI requests. Cheap to share: all per-request state lives in the
/// pipeline spawned for that request.
pub struct CgiCoordinator {
    meta: ServerMeta,
    pass_env: Vec<String>,
    transfer: BodyTransfer,
    grace: Duration,
    admission: Option<Arc<Semaphore>>,
    active: Arc<AtomicUsize>,
}

impl CgiCoordinator {
    pub fn new(config: &Config) -> Self {
        CgiCoordinator {
            meta: ServerMeta {
                server_name: config.server_name.clone(),
                server_port: config.listen.port(),
                server_software: config.server_software.clone(),
            },
            pass_env: config.pass_env.clone(),
            transfer: BodyTransfer::new(config.chunked_body, config.max_body_size),
            grace: config.kill_grace(),
            admission: config.max_processes.map(|max| Arc::new(Semaphore::new(max))),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Scripts currently running.
    pub fn active_processes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Always produces a response; failures become error pages.
    pub async fn handle(&self, req: CgiRequest, target: &ScriptTarget) -> Response<Body> {
        let method = req.head.method.clone();
        match self.dispatch(req, target).await {
            Ok(res) => res,
            Err(err) => {
                let status = err.status();
                match &err {
                    CgiError::MalformedBody(_) | CgiError::BodyTooLarge { .. } => {
                        info!("{} {}: {}", method, target.script_name, err)
                    }
                    _ => error!("{} {}: {}", method, target.script_name, err),
                }
                error_response(status)
            }
        }
    }

    async fn dispatch(&self, req: CgiRequest, target: &ScriptTarget) -> Result<Response<Body>, CgiError> {
        let deadline = Instant::now() + target.timeout;
        let CgiRequest { head, body } = req;

        let body = time::timeout_at(deadline, self.transfer.prepare(body))
            .await
            .map_err(|_| CgiError::Timeout(target.timeout))??;
        let env = EnvironmentBuilder::new(&self.meta, &self.pass_env).build(&head, target, body.length)?;

        let permit = match &self.admission {
            Some(slots) => Some(
                time::timeout_at(deadline, slots.clone().acquire_owned())
                    .await
                    .map_err(|_| CgiError::Overloaded)?
                    .map_err(|_| CgiError::Overloaded)?,
            ),
            None => None,
        };

        let process = ProcessRunner::start(&env, &target.command())?;
        debug!(
            "{} {} running {} as pid {}",
            head.method,
            head.uri,
            target.script_path.display(),
            process.pid()
        );

        let (reply, response) = oneshot::channel();
        let pipeline = Pipeline {
            process,
            script: target.script_name.clone(),
            deadline,
            grace: self.grace,
            outlet: Outlet::Pending(reply),
            _permit: permit,
            _active: ActiveGuard::new(&self.active),
        };
        tokio::spawn(pipeline.run(body));

        response
            .await
            .map_err(|_| CgiError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "pipeline ended without a response",
            )))?
    }
}
