use std::{thread, time::{Duration, Instant}};
use tokio::runtime::Builder;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden::{Catalog, Promise, TargetId, Warden};

const CATALOG: &str = r#"
[[pool]]
name = "reports"
core = 2
max = 4
shutdown_grace_ms = 1000

[[type]]
name = "demo::Reports"
async = { pool = "reports" }
throttling = { permits = 2 }

[[method]]
type = "demo::Reports"
name = "render"
throttled = { weight = 1, timeout_ms = 750 }
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter)
        .init();

    let rt = Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;

    let warden = Warden::builder()
        .catalog(Catalog::from_toml_str(CATALOG)?)
        .build();

    let now = Instant::now();
    let render = TargetId::new("demo::Reports", "render");
    let build = TargetId::deferred("demo::Reports", "build");

    let handles: Vec<_> = (0..4)
        .map(|i| {
            warden.dispatcher().dispatch(&build, move || {
                thread::sleep(Duration::from_millis(100));
                Promise::completed(format!("report-{i}"))
            })
        })
        .collect::<Result<_, _>>()?;

    let reports = rt.block_on(async {
        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await);
        }
        out
    });
    for report in reports {
        tracing::info!(?report, "dispatched");
    }

    thread::scope(|s| {
        for i in 0..3 {
            let warden = &warden;
            let render = &render;
            s.spawn(move || {
                let outcome = warden.throttles().run(render, || {
                    thread::sleep(Duration::from_millis(400));
                    i
                });
                tracing::info!(?outcome, "throttled render");
            });
        }
    });

    warden.shutdown();
    println!("elapsed: {:?}", now.elapsed());
    Ok(())
}
