//! Accept loop and worker pool
//!
//! One OS thread per worker, one cooperative scheduler per thread. All
//! workers share the listening socket; `accept4` hands each connection to
//! exactly one of them. A worker's accept loop runs on its scheduler's main
//! task, so a SIGTERM/SIGINT surfaces there as `Cancelled` and the worker
//! falls through to draining its in-flight connections.

use crate::config::ServerOptions;
use crate::conn::Conn;
use crate::error::{HttpError, ServerError};
use crate::router::Router;
use crate::tcp::{TcpListener, TcpStream};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strand_core::{kib, kinfo, kwarn, Arena};
use strand_runtime::spawn;

/// Coroutine stack per connection, carved from the connection's own arena
/// ahead of the receive buffer so the per-request rollback never touches it.
const CONN_STACK_SIZE: usize = kib(64);

const ARENA_INITIAL: usize = kib(16);

static CONN_IDS: AtomicU64 = AtomicU64::new(0);

/// Bind, spin up the workers, and serve until the process receives SIGTERM
/// or SIGINT. Returns once every worker has drained.
pub fn serve(options: ServerOptions, router: Router) -> Result<(), ServerError> {
    options.validate()?;
    let listener = Arc::new(TcpListener::bind(
        &options.host,
        &options.port,
        options.backlog,
    )?);
    let router = Arc::new(router);
    let options = Arc::new(options);
    let workers = options.effective_workers();
    kinfo!(
        "listening on {}:{} with {} worker(s)",
        options.host,
        options.port,
        workers
    );

    let mut handles = Vec::with_capacity(workers);
    for id in 0..workers {
        let listener = listener.clone();
        let router = router.clone();
        let options = options.clone();
        let handle = std::thread::Builder::new()
            .name(format!("strand-worker-{id}"))
            .spawn(move || worker_main(id, listener, router, options))
            .map_err(|e| ServerError::Listen(format!("spawn worker {id}: {e}")))?;
        handles.push(handle);
    }

    let mut first_err = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                kwarn!("worker failed: {e}");
                first_err.get_or_insert(e);
            }
            Err(_) => kwarn!("worker panicked"),
        }
    }
    kinfo!("server stopped");
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn worker_main(
    id: usize,
    listener: Arc<TcpListener>,
    router: Arc<Router>,
    options: Arc<ServerOptions>,
) -> Result<(), ServerError> {
    loop {
        match listener.accept() {
            Ok(stream) => {
                if let Err(e) = start_connection(stream, &router, &options) {
                    kwarn!("worker {id}: connection setup failed: {e}");
                }
            }
            Err(HttpError::Cancelled) => break,
            Err(HttpError::Io(e)) if e == libc::EMFILE || e == libc::ENFILE => {
                // Out of descriptors; let in-flight connections finish
                // before accepting again.
                kwarn!("worker {id}: descriptor limit reached (errno {e})");
                strand_runtime::sleep(100)?;
            }
            Err(e) => kwarn!("worker {id}: accept failed: {e}"),
        }
    }

    kinfo!("worker {id}: draining");
    strand_runtime::shutdown(options.shutdown_timeout_ms)?;
    Ok(())
}

/// Give the connection an arena and a task. The `Conn` itself is built
/// inside the task, after the stack allocation, so the stack sits below the
/// connection's per-request marker.
fn start_connection(
    stream: TcpStream,
    router: &Arc<Router>,
    options: &Arc<ServerOptions>,
) -> Result<(), HttpError> {
    let id = CONN_IDS.fetch_add(1, Ordering::Relaxed);

    stream.set_keepalive(
        options.keepalive_idle_secs,
        options.keepalive_count,
        options.keepalive_interval_secs,
    );
    stream.set_user_timeout(options.tcp_user_timeout_ms);
    stream.set_nodelay(options.tcp_nodelay);

    let arena = Rc::new(Arena::new(ARENA_INITIAL, options.mem_connection_max)?);
    let task_arena = arena.clone();
    let cleanup_arena = arena.clone();
    let router = router.clone();
    let options = options.clone();
    spawn(
        &arena,
        CONN_STACK_SIZE,
        move || match Conn::new(task_arena, stream, router, &options) {
            Ok(conn) => conn.run(),
            Err(e) => kwarn!("conn {id}: setup failed: {e}"),
        },
        move || drop(cleanup_arena),
    )?;
    Ok(())
}
