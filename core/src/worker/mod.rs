mod model_worker;

pub use model_worker::{run_worker, Worker, WorkerContext};
