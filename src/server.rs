use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{Engine, Worker};
use crate::protocol::CommandExecutor;
use crate::store::HashTable;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Key-value server: one table, one engine, a fixed pool of workers
pub struct Server {
    config: Config,
    engine: Arc<Engine>,
    workers: Vec<Worker>,
    local_addr: SocketAddr,
}

impl Server {
    /// Validate `config`, build the table and bind the listener.
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let table = Arc::new(HashTable::new(config.slot_bits, config.max_shards)?);

        let listener = TcpListener::bind((config.bind_addr.as_str(), config.port))?;
        let local_addr = listener.local_addr()?;

        let (engine, workers) = Engine::new(&config, listener, CommandExecutor::new(table))?;

        info!("listen channel created : {}", local_addr);

        Ok(Self {
            config,
            engine: Arc::new(engine),
            workers,
            local_addr,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn table(&self) -> &Arc<HashTable> {
        self.engine.executor().table()
    }

    /// Run the worker pool. Blocks until every worker has exited, which
    /// only happens when polling fails.
    pub fn run(self) -> Result<()> {
        let cpus = num_cpus::get();
        let mut handles = Vec::with_capacity(self.workers.len());

        for worker in self.workers {
            let engine = Arc::clone(&self.engine);
            let pin = self.config.cpu_affinity.then_some(worker.index() % cpus);

            let handle = thread::Builder::new()
                .name(format!("yari-worker-{}", worker.index()))
                .spawn(move || {
                    if let Some(cpu) = pin {
                        pin_to_cpu(cpu);
                    }
                    run_worker(&engine, worker);
                })?;
            handles.push(handle);
        }

        info!("{} worker threads started", handles.len());

        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }

        Ok(())
    }
}

fn run_worker(engine: &Engine, worker: Worker) {
    info!("worker {} started", worker.index());

    loop {
        engine.thread_process();

        if let Err(e) = engine.thread_wait(&worker) {
            error!("worker {} exiting: {}", worker.index(), e);
            return;
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    let result = set
        .set(cpu)
        .and_then(|_| sched_setaffinity(Pid::from_raw(0), &set));

    if let Err(e) = result {
        warn!("failed to pin worker to cpu {}: {}", cpu, e);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(cpu: usize) {
    warn!("cpu affinity not supported here, cpu {} ignored", cpu);
}
