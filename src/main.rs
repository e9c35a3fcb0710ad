use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use cfscan::cli::Cli;
use cfscan::config::{
    clean_mode, funnel_preset, CF_SUBNETS, LATENCY_TIMEOUT, LATENCY_WORKERS, SPEED_HOST,
    SPEED_TIMEOUT, SPEED_WORKERS,
};
use cfscan::core::pipeline::{
    fetch_subscription, generate_from_template, load_addresses, load_configs_from_file,
    resolve_ipv4, FragPreset, ParsedConfig, Pipeline, PipelineOptions, PipelineState, Transport,
};
use cfscan::core::{
    calc_scores, dbg_line, expand, scan, sorted_all, Funnel, IpResult, RateLimiter, ScanOptions,
    ScanState, SortKey, TlsProber, TlsSpeedClient,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();
    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    if cli.find_clean {
        return run_clean(&cli, &mut rng).await;
    }

    let configs = load_configs(&cli)?;
    if configs.is_empty() {
        eprintln!("no configs loaded (use -i, --sub, or --template with --addresses)");
        return Ok(());
    }
    println!("loaded {} configs", configs.len());

    if cli.pipeline {
        run_pipeline(&cli, &configs[0], &mut rng).await
    } else {
        run_config_scan(&cli, configs).await
    }
}

fn load_configs(cli: &Cli) -> Result<Vec<ParsedConfig>, Box<dyn std::error::Error>> {
    if let Some(template) = &cli.template {
        let addresses = match &cli.addresses {
            Some(path) => load_addresses(path)?,
            None => Vec::new(),
        };
        return Ok(generate_from_template(template, &addresses));
    }
    if let Some(url) = &cli.sub {
        return Ok(fetch_subscription(url)?);
    }
    if let Some(path) = &cli.input {
        return Ok(load_configs_from_file(path)?);
    }
    Ok(Vec::new())
}

fn spawn_interrupt_watch(state: Arc<ScanState>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupted, collecting partial results...");
            state.interrupt();
        }
    });
}

fn spawn_progress(state: Arc<ScanState>, label: &'static str) -> tokio::task::AbortHandle {
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let done = state.done.load(Ordering::Relaxed);
            let total = state.total.load(Ordering::Relaxed);
            let found = state.found.load(Ordering::Relaxed);
            if total > 0 {
                eprint!(
                    "\r  {} {}/{} ({}%)  found {}   ",
                    label,
                    done,
                    total,
                    done * 100 / total,
                    found
                );
            }
        }
    });
    handle.abort_handle()
}

async fn run_clean(
    cli: &Cli,
    rng: &mut StdRng,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = clean_mode(&cli.clean_mode)
        .ok_or_else(|| format!("unknown clean mode: {}", cli.clean_mode))?;

    let ips: Vec<Ipv4Addr> = match &cli.input {
        Some(input) => expand::expand_freeform(input)?,
        None => expand::expand_cidrs(CF_SUBNETS, mode.sample, rng),
    };
    let ports = cli.parsed_ports().unwrap_or_else(|| mode.ports.to_vec());
    let opts = ScanOptions {
        sni: SPEED_HOST.to_string(),
        timeout: Duration::from_secs_f64(cli.timeout.unwrap_or(3.0)),
        validate: mode.validate,
        ports,
        concurrency: cli.workers.unwrap_or(mode.workers),
    };
    println!(
        "clean scan [{}]: {} ips x {} ports, {} workers",
        mode.label,
        ips.len(),
        opts.ports.len(),
        opts.concurrency
    );

    let state = Arc::new(ScanState::new());
    spawn_interrupt_watch(state.clone());
    let progress = spawn_progress(state.clone(), "probing");

    let prober = Arc::new(TlsProber::default());
    let outcome = scan(prober, &ips, &opts, state.clone(), rng).await;
    progress.abort();
    eprintln!();

    let top = if cli.top == 0 { outcome.ranked.len() } else { cli.top };
    if cli.json {
        let entries: Vec<serde_json::Value> = outcome
            .ranked
            .iter()
            .take(top)
            .map(|(ip, latency)| {
                serde_json::json!({
                    "ip": ip.to_string(),
                    "latency_ms": latency,
                    "ports": outcome.ip_ports.get(ip),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    println!("{} live ips", outcome.ranked.len());
    for (ip, latency) in outcome.ranked.iter().take(top) {
        let ports = outcome
            .ip_ports
            .get(ip)
            .map(|p| {
                p.iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_default();
        println!("{:<16} {:>8.1} ms  ports {}", ip, latency, ports);
    }
    Ok(())
}

async fn run_config_scan(
    cli: &Cli,
    configs: Vec<ParsedConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    // Resolve config addresses and group by IP.
    let mut ip_map: HashMap<Ipv4Addr, Vec<&ParsedConfig>> = HashMap::new();
    for cfg in &configs {
        if let Some(ip) = resolve_ipv4(&cfg.address).await {
            ip_map.entry(ip).or_default().push(cfg);
        }
    }
    let ips: Vec<Ipv4Addr> = ip_map.keys().copied().collect();
    println!(
        "resolved {} configs -> {} unique ips",
        configs.len(),
        ips.len()
    );
    if ips.is_empty() {
        return Ok(());
    }

    let results: Arc<Mutex<HashMap<Ipv4Addr, IpResult>>> = Arc::new(Mutex::new(
        ip_map
            .iter()
            .map(|(ip, cfgs)| {
                let mut r = IpResult::new(*ip);
                r.domains = cfgs.iter().map(|c| c.address.clone()).collect();
                r.uris = cfgs.iter().map(|c| c.to_uri()).collect();
                (*ip, r)
            })
            .collect(),
    ));

    let state = Arc::new(ScanState::new());
    spawn_interrupt_watch(state.clone());

    let funnel = Funnel {
        client: Arc::new(TlsSpeedClient),
        limiter: Arc::new(RateLimiter::new()),
        workers: cli.speed_workers.unwrap_or(SPEED_WORKERS),
        timeout: cli
            .speed_timeout
            .map(Duration::from_secs_f64)
            .unwrap_or(SPEED_TIMEOUT),
    };

    let progress = spawn_progress(state.clone(), "latency");
    funnel
        .latency_phase(
            &ips,
            SPEED_HOST,
            cli.workers.unwrap_or(LATENCY_WORKERS),
            cli.timeout
                .map(Duration::from_secs_f64)
                .unwrap_or(LATENCY_TIMEOUT),
            &results,
            &state,
        )
        .await;
    progress.abort();
    eprintln!();

    let alive_n = results
        .lock()
        .map(|m| m.values().filter(|r| r.alive).count())
        .unwrap_or(0);
    println!("latency phase done: {} alive", alive_n);
    if alive_n > 0 && !state.is_interrupted() {
        let preset = funnel_preset(&cli.mode);
        funnel.run_rounds(&results, preset, &state).await;
    }

    let mut map = results.lock().expect("results lock").clone();
    calc_scores(&mut map);
    let all = sorted_all(&map, SortKey::Score);
    let top = if cli.top == 0 { all.len() } else { cli.top };
    if cli.json {
        let shown: Vec<&IpResult> = all.iter().take(top).collect();
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }
    println!(
        "{:<16} {:>8} {:>8} {:>8} {:>9} {:>6}  {}",
        "ip", "tls ms", "ttfb ms", "MB/s", "score", "colo", "status"
    );
    for r in all.iter().take(top) {
        let status = match (&r.error, r.alive) {
            (_, true) => "alive".to_string(),
            (Some(e), false) => e.short(),
            (None, false) => "dead".to_string(),
        };
        println!(
            "{:<16} {:>8.1} {:>8.1} {:>8.2} {:>9.1} {:>6}  {}",
            r.ip, r.tls_ms, r.ttfb_ms, r.best_mbps, r.score, r.colo, status
        );
    }
    dbg_line("Main", "config scan finished");
    Ok(())
}

async fn run_pipeline(
    cli: &Cli,
    parsed: &ParsedConfig,
    rng: &mut StdRng,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut opts = PipelineOptions::default();
    if let Some(ports) = cli.parsed_ports() {
        opts.ports = ports;
    }
    if let Some(n) = cli.max_variations {
        opts.max_variations = n;
    }
    if let Some(n) = cli.max_snis {
        opts.max_snis_per_ip = n;
    }
    if let Some(pool) = &cli.sni_pool {
        opts.sni_pool = pool
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    opts.frag_preset = FragPreset::parse(&cli.fragments);
    if let Some(transports) = &cli.transports {
        opts.transport_variants = transports
            .split(',')
            .map(|t| Transport::parse(t.trim()))
            .collect();
    }
    opts.xray_bin = cli.xray_bin.clone().into();
    if let Some(t) = cli.timeout {
        opts.probe_timeout = Duration::from_secs_f64(t);
    }

    println!(
        "pipeline: {} {}:{} ({}/{})",
        parsed.protocol, parsed.address, parsed.port,
        parsed.transport.as_str(),
        parsed.security.as_str()
    );

    let state = Arc::new(PipelineState::new());
    {
        let state = state.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupted, collecting partial results...");
                state.interrupt();
            }
        });
    }

    let pipeline = Pipeline::new(Arc::new(TlsProber::default()), opts);
    let outcome = pipeline.run(parsed, state, rng).await;

    for warning in &outcome.warnings {
        eprintln!("warning: {}", warning);
    }
    println!(
        "{} live ips, {} working, {} variations tested",
        outcome.live_ips.len(),
        outcome.working_ips.len(),
        outcome.variations.len()
    );
    let top = if cli.top == 0 {
        outcome.variations.len()
    } else {
        cli.top
    };
    if cli.json {
        let entries: Vec<serde_json::Value> = outcome
            .variations
            .iter()
            .take(top)
            .map(|v| {
                serde_json::json!({
                    "ip": v.source_ip.to_string(),
                    "port": v.source_port,
                    "sni": v.sni,
                    "fragment": v.fragment_label,
                    "transport": v.transport_label,
                    "alive": v.alive,
                    "native": v.native_tested,
                    "connect_ms": v.connect_ms,
                    "ttfb_ms": v.ttfb_ms,
                    "mbps": v.speed_mbps,
                    "score": v.score,
                    "error": v.error.as_ref().map(|e| e.short()),
                    "uri": v.result_uri,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    println!(
        "{:<18} {:>5} {:<24} {:<10} {:>8} {:>8} {:>7}  {}",
        "ip:port", "tport", "sni", "fragment", "conn ms", "ttfb ms", "score", "status"
    );
    for v in outcome.variations.iter().take(top) {
        let status = if v.alive {
            if v.native_tested { "alive (native)" } else { "alive" }.to_string()
        } else {
            v.error.as_ref().map(|e| e.short()).unwrap_or_else(|| "dead".to_string())
        };
        println!(
            "{:<18} {:>5} {:<24} {:<10} {:>8.1} {:>8.1} {:>7.1}  {}",
            format!("{}:{}", v.source_ip, v.source_port),
            v.transport_label,
            v.sni,
            v.fragment_label,
            v.connect_ms,
            v.ttfb_ms,
            v.score,
            status
        );
    }
    // Re-emitted URIs for the best survivors.
    for v in outcome.variations.iter().filter(|v| v.alive).take(10) {
        println!("{}", v.result_uri);
    }
    Ok(())
}
