mod interactive;

use std::{cell::RefCell, fs::File, io::Read, path::PathBuf, rc::Rc};

use anyhow::Result;
use cache_sim::{
    cache::DirectMappedCache,
    config::{FillPolicy, SimConfig},
    memory::Memory,
    program::Program,
    sim::Simulator,
};
use clap::{Args, Parser, Subcommand};

#[cfg(feature = "stat")]
use terminal_size::terminal_size;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// run an access trace without and then with the cache
    Run(RunArgs),
    /// issue accesses one by one from a prompt
    Interactive(CommonArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// File path to a JSON configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Address bus width in bits
    #[arg(long)]
    bus_width: Option<u32>,
    /// Number of cache lines (power of two)
    #[arg(long)]
    lines: Option<usize>,
    /// Bytes per cache line (power of two)
    #[arg(long)]
    block_size: Option<usize>,
    /// Backing store size in bytes (defaults to the whole address space)
    #[arg(long)]
    capacity: Option<usize>,
    /// Fill the backing store with pseudo-random bytes from this seed
    #[arg(long)]
    seed: Option<u64>,
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    delegate: CommonArgs,
    /// File path to an access trace (reference sequence when omitted)
    #[arg(short, long)]
    trace: Option<PathBuf>,
}

impl CommonArgs {
    fn init_logger(&self) {
        if self.verbose {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
        } else {
            env_logger::init();
        }
    }
    fn sim_config(&self) -> Result<SimConfig> {
        let mut config = match &self.config {
            Some(p) => SimConfig::deser(File::open(p)?)?,
            None => SimConfig::default(),
        };
        if let Some(bus_width) = self.bus_width {
            config.cache.bus_width = bus_width;
            config.cache.capacity = None;
        }
        if let Some(lines) = self.lines {
            config.cache.num_lines = lines;
        }
        if let Some(block_size) = self.block_size {
            config.cache.block_size = block_size;
        }
        if let Some(capacity) = self.capacity {
            config.memory.capacity = Some(capacity);
        }
        if let Some(seed) = self.seed {
            config.memory.fill = FillPolicy::Random { seed };
        }
        log::info!("configuration: {config:?}");
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    match args.command {
        Command::Run(RunArgs { delegate, trace }) => {
            delegate.init_logger();
            let config = delegate.sim_config()?;
            let program = match trace {
                Some(p) => Program::parse(&read_to_string(p)?)?,
                None => Program::reference(),
            };
            log::info!("program of {} accesses", program.len());

            println!("===== memory access without cache =====");
            let bus_width = config.cache.resolved_bus_width()?;
            let mut mem = Memory::from_config(&config.memory, bus_width)?;
            let uncached = Simulator::new(&mut mem).run(&program)?;
            println!("total time = {}", uncached.total_time);

            println!("===== memory access through direct-mapped cache =====");
            let mut sim = Simulator::new(cached(&config)?);
            let report = sim.run(&program)?;
            println!("total time = {}", report.total_time);
            output_stat(&sim);
            Ok(())
        }
        Command::Interactive(delegate) => {
            delegate.init_logger();
            let config = delegate.sim_config()?;
            let mut sim = Simulator::new(cached(&config)?);
            println!("{}", sim.port().geometry());
            interactive::execute_interactive(&mut sim)
        }
    }
}

fn cached(config: &SimConfig) -> Result<DirectMappedCache> {
    let mut cache = DirectMappedCache::from_config(&config.cache)?;
    let mem = Memory::from_config(&config.memory, cache.geometry().bus_width)?;
    cache.bind(Rc::new(RefCell::new(mem)))?;
    Ok(cache)
}

#[cfg(not(feature = "stat"))]
fn output_stat(_: &Simulator<DirectMappedCache>) {}

#[cfg(feature = "stat")]
fn output_stat(sim: &Simulator<DirectMappedCache>) {
    let max_width = get_terminal_width().unwrap_or(120) as usize;
    log::info!("statistics:\n{}", sim.collect_stat().view(max_width));
}

#[cfg(feature = "stat")]
fn get_terminal_width() -> Option<u16> {
    terminal_size().map(|(w, _)| w.0.saturating_sub(20))
}

fn read_to_string(input: PathBuf) -> Result<String> {
    let mut buf = String::new();
    let mut file = File::open(input)?;
    file.read_to_string(&mut buf)?;
    Ok(buf)
}
