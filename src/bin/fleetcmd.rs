use fleetcmd::config::AppConfig;
use fleetcmd::discovery::StaticDiscovery;
use fleetcmd::dispatch;
use fleetcmd::error::AppError;
use fleetcmd::report::RunReport;
use fleetcmd::telemetry;
use fleetcmd::template::Template;
use std::time::Instant;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("--version") => {
            println!("fleetcmd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") | None => {
            print_help();
            return Ok(());
        }
        _ => {}
    }

    if args.len() != 2 {
        eprintln!("fleetcmd 需要一个子命令和一个模板文件");
        print_help();
        std::process::exit(2);
    }

    let (command, template_path) = (args[0].as_str(), args[1].as_str());

    if !template_path.ends_with(".json") {
        eprintln!("模板文件必须是 JSON 文档: {}", template_path);
        std::process::exit(2);
    }

    dotenv::dotenv().ok();

    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    match command {
        "gen" => {
            Template::write_sample(template_path)?;
            println!("示例模板已写入 {}", template_path);
            Ok(())
        }
        "val" => {
            Template::load(template_path)?;
            println!("模板 {} 校验通过", template_path);
            Ok(())
        }
        "run" => run_command(template_path, &config).await,
        other => {
            eprintln!("不支持的子命令: {}", other);
            print_help();
            std::process::exit(2);
        }
    }
}

async fn run_command(template_path: &str, config: &AppConfig) -> anyhow::Result<()> {
    let template = Template::load(template_path)?;

    // 云清单客户端可在此替换 StaticDiscovery 接入动态发现
    let discovery = StaticDiscovery::new(vec![]);
    let run = template.resolve(&discovery).await?;

    tracing::info!(
        nodes = run.nodes.len(),
        bastion = %run.bastion_host,
        command = %run.command,
        "Starting fleet run"
    );

    let started = Instant::now();
    match dispatch::run_fleet(&run, config).await {
        Ok(report) => {
            print_report(&report);
            println!("命令已在全部节点执行完毕，耗时 {} 秒", started.elapsed().as_secs());
            if report.all_succeeded() {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Err(AppError::Timeout { report }) => {
            print_report(&report);
            eprintln!(
                "运行超时，{} 台主机未完成: {}",
                report.unfinished.len(),
                report.unfinished.join(", ")
            );
            std::process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &RunReport) {
    for node in &report.completed {
        println!("  {} — {}", node.address, node.status);
    }
    for node in &report.failed {
        println!("  {} — failed: {}", node.address, node.reason);
    }
    for address in &report.unfinished {
        println!("  {} — unfinished", address);
    }
}

fn print_help() {
    println!("fleetcmd {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: fleetcmd <子命令> <template.json>");
    println!();
    println!("子命令:");
    println!("  gen     在指定路径生成示例模板");
    println!("  val     校验模板文件");
    println!("  run     在远程主机上执行模板中的命令");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  运行配置通过 FLEET_ 前缀的环境变量完成，");
    println!("  例如 FLEET_DISPATCH__DEADLINE_SECS=60");
}
