//! Frame job demo
//!
//! Schedules a layout pass and a paint pass as a command group and waits
//! for both. Run with `RUST_LOG=debug` to see dispatch logging.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fos_jobs::{
    Command, CommandGroup, CommandList, CommandQueue, JobError, JobSystem, JobSystemConfig,
    ListPriority, ThreadAffinity, WorkloadCategory,
};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = JobSystemConfig::new(1, 1, 2, 2).with_dynamic_growth(true);
    let system = JobSystem::with_config(config)?;
    println!("=== fos-jobs {} ===", fos_jobs::VERSION);
    println!("Workers: {} of {}\n", system.thread_count(), system.max_threads());

    let boxes = Arc::new(AtomicUsize::new(0));
    let layout = CommandQueue::new(WorkloadCategory::Layout, ThreadAffinity::FreeLayout);
    for section in ["header", "main", "footer"] {
        let boxes = Arc::clone(&boxes);
        let priority = if section == "main" {
            ListPriority::High
        } else {
            ListPriority::Normal
        };
        let list = CommandList::for_queue(&layout)
            .with_priority(priority)
            .with_command(Command::from_fn(
                WorkloadCategory::Layout,
                ThreadAffinity::FreeLayout,
                move || {
                    boxes.fetch_add(8, Ordering::SeqCst);
                    format!("laid out {section}")
                },
            ));
        layout.add_list(list).map_err(JobError::from)?;
    }

    let paint = CommandQueue::new(WorkloadCategory::Rendering, ThreadAffinity::FreeRendering);
    let raster = Command::from_fn(WorkloadCategory::Rendering, ThreadAffinity::FreeRendering, || {
        800i64 * 600
    });
    let raster_handle = raster.handle();
    paint
        .add_list(CommandList::for_queue(&paint).with_command(raster))
        .map_err(JobError::from)?;

    let frame = CommandGroup::new("frame", ThreadAffinity::AnyThread)
        .with_queue(layout.clone())
        .with_queue(paint.clone())
        .required(true);
    system.add_command_group(frame.clone())?;

    let jobs = system.submit_group(&frame)?;
    println!("Submitted {} jobs", jobs.len());

    let pixels = raster_handle.join(None)?;
    system.wait();

    println!("Layout boxes: {}", boxes.load(Ordering::SeqCst));
    println!("Raster result: {:?}", pixels);

    let stats = system.stats();
    println!(
        "Completed {} jobs, {} failed commands, {} groups",
        stats.completed_jobs, stats.failed_commands, stats.command_groups
    );

    system.shutdown();
    Ok(())
}
