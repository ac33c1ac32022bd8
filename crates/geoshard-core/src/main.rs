//! Geoshard CLI - Sharded road graph indexing and queries
//!
//! Commands:
//! - `index` - Build the global index over a directory of shard files
//! - `stats` - Show dataset and cache statistics
//! - `query` - Run a lookup against the virtual graph
//! - `load` - Load every cell and report timing

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use geo::Rect;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use geoshard_config::{ConfigLoader, ConfigOverrides, GeoshardConfig, LogFormat};
use geoshard_core::sharding::{IndexBuilder, IndexSettings, Repository};
use geoshard_core::{
    rect_from_locations, EdgeIdentifier, FunctionalClass, Grid, Location, RoadEdge, RoadVertex,
    VirtualGraph, WayIdentifier,
};

/// Geoshard - Partitioned road graph storage and queries
#[derive(Parser)]
#[command(name = "geoshard")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace directory holding `.geoshard/config.toml`
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Dataset name (overrides config)
    #[arg(short, long, global = true)]
    dataset: Option<String>,

    /// Remote repository to mirror before opening (overrides config)
    #[arg(long, global = true)]
    remote: Option<PathBuf>,

    /// Worker threads for bulk operations (overrides config)
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the global index from the shard files in the local repository
    Index {
        /// Dataset bounds as min_lat,min_lon,max_lat,max_lon
        #[arg(short, long, value_parser = parse_bbox)]
        bounds: Rect<f64>,

        /// Cell size in degrees (defaults to config)
        #[arg(long)]
        cell_size: Option<f64>,
    },

    /// Show statistics about a dataset
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query the virtual graph
    Query {
        #[command(subcommand)]
        target: QueryTarget,
    },

    /// Load every cell and build its spatial indexes
    Load,
}

#[derive(Subcommand)]
enum QueryTarget {
    /// Every shard-local fragment of a way
    Way { way: u64 },

    /// One edge by way and section
    Edge {
        way: u64,
        #[arg(default_value_t = 0)]
        section: u32,
    },

    /// Forward edges intersecting a bounding box
    Edges {
        #[arg(value_parser = parse_bbox)]
        bbox: Rect<f64>,
    },

    /// Vertices inside a bounding box
    Vertices {
        #[arg(value_parser = parse_bbox)]
        bbox: Rect<f64>,
    },

    /// Nearest vertex to a location
    Nearest {
        lat: f64,
        lon: f64,

        /// Search radius in meters
        #[arg(short, long, default_value_t = 100.0)]
        radius: f64,

        /// Minimum functional class (0-5) of an adjacent edge
        #[arg(long)]
        min_class: Option<u8>,
    },

    /// Significant places inside a bounding box
    Places {
        #[arg(value_parser = parse_bbox)]
        bbox: Rect<f64>,
    },

    /// Significant place at a location
    PlaceAt { lat: f64, lon: f64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        dataset: cli.dataset.clone(),
        remote_repository: cli.remote.clone(),
        threads: cli.threads,
        log_level: cli.verbose.then(|| "debug".to_string()),
        ..Default::default()
    };
    let config = ConfigLoader::new()
        .load(&cli.workspace, Some(&overrides))
        .context("Failed to load configuration")?;

    // Setup logging
    let filter = EnvFilter::try_new(&config.logging.level)
        .with_context(|| format!("Invalid log level: {}", config.logging.level))?;
    match config.logging.format {
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    match cli.command {
        Commands::Index { bounds, cell_size } => {
            cmd_index(&config, &cli.workspace, bounds, cell_size)
        }
        Commands::Stats { json } => cmd_stats(&config, &cli.workspace, json),
        Commands::Query { target } => cmd_query(&config, &cli.workspace, target),
        Commands::Load => cmd_load(&config, &cli.workspace),
    }
}

/// Build the global index over the local repository
fn cmd_index(
    config: &GeoshardConfig,
    workspace: &Path,
    bounds: Rect<f64>,
    cell_size: Option<f64>,
) -> Result<()> {
    let start = Instant::now();
    let repository = Repository::from_config(config, workspace);
    if let Some(remote) = config.remote_repository(workspace) {
        repository
            .mirror_from(&remote)
            .context("Failed to mirror remote repository")?;
    }

    let cell_size = cell_size.unwrap_or(config.dataset.cell_size_degrees);
    info!(
        "Indexing {} at {:?} with {} degree cells",
        config.dataset.name,
        repository.root(),
        cell_size
    );

    let grid = Grid::build_in(cell_size, bounds, &repository.cells_dir())
        .context("Failed to lay out grid")?;
    let settings = IndexSettings {
        min_place_population: config.stitching.min_place_population,
        place_tolerance_meters: config.stitching.place_tolerance_meters,
    };
    let stats = IndexBuilder::new(settings)
        .with_threads(config.loading.threads)
        .build_and_save(&grid, &config.dataset.name, &repository.index_path())
        .context("Failed to build global index")?;

    println!("\nIndex build complete!");
    println!("  Output: {:?}", repository.index_path());
    println!("  Grid: {} x {} cells", grid.rows(), grid.cols());
    println!("  Shards indexed: {}", stats.shards_indexed);
    println!("  Ways: {}", stats.ways);
    println!("  Places: {}", stats.places);
    println!("  Vertices: {}", stats.vertices);
    println!("  Edges: {}", stats.edges);
    println!("  Time: {:.2}s", start.elapsed().as_secs_f64());

    Ok(())
}

/// Show dataset statistics
fn cmd_stats(config: &GeoshardConfig, workspace: &Path, json_output: bool) -> Result<()> {
    let graph = open_graph(config, workspace)?;
    let metadata = graph.metadata();

    if json_output {
        let json = serde_json::to_string_pretty(&metadata)?;
        println!("{}", json);
        return Ok(());
    }

    let stats = graph.stats();
    println!("\nDataset Statistics");
    println!("==================");
    println!("  Name: {}", metadata.name);
    println!("  Cell size: {} degrees", metadata.cell_size_degrees);
    println!(
        "  Cells: {} ({} populated)",
        stats.total_cells, stats.populated_cells
    );
    println!("  Vertices: {}", metadata.vertex_count);
    println!(
        "  Edges: {} ({} forward)",
        metadata.edge_count, metadata.forward_edge_count
    );
    println!("  Relations: {}", metadata.relation_count);
    println!("  Places: {}", metadata.place_count);
    println!();
    println!("Cache:");
    println!("  Loaded cells: {}", stats.loaded_cells);
    println!(
        "  Memory: {} / {} bytes",
        stats.memory_usage_bytes, stats.memory_budget_bytes
    );

    Ok(())
}

/// Run one query against the virtual graph
fn cmd_query(config: &GeoshardConfig, workspace: &Path, target: QueryTarget) -> Result<()> {
    let graph = open_graph(config, workspace)?;

    match target {
        QueryTarget::Way { way } => {
            let edges = graph
                .edges_for_way(WayIdentifier(way))
                .context("Way lookup failed")?;
            if edges.is_empty() {
                println!("Way {} not found", way);
            }
            for edge in edges {
                println!(
                    "  {} {} {:.1}m",
                    edge.id(),
                    edge.identifier(),
                    edge.length_meters()
                );
            }
        }
        QueryTarget::Edge { way, section } => {
            let identifier = EdgeIdentifier::try_new(WayIdentifier(way), section)
                .with_context(|| format!("No edge identifier for section {} of way {}", section, way))?;
            match graph
                .edge_for_identifier(identifier)
                .context("Edge lookup failed")?
            {
                Some(edge) => println!(
                    "  {} {} class={:?} reversible={}",
                    edge.id(),
                    edge.identifier(),
                    edge.functional_class(),
                    edge.is_reversible()
                ),
                None => println!("Edge {} not found", identifier),
            }
        }
        QueryTarget::Edges { bbox } => {
            let edges = graph
                .edges_intersecting(&bbox)
                .context("Edge query failed")?;
            println!("{} edges", edges.len());
            for edge in edges {
                println!("  {} {}", edge.id(), edge.identifier());
            }
        }
        QueryTarget::Vertices { bbox } => {
            let vertices = graph
                .vertexes_inside(&bbox)
                .context("Vertex query failed")?;
            println!("{} vertices", vertices.len());
            for vertex in vertices {
                println!(
                    "  {} {}{}",
                    vertex.id(),
                    vertex.location(),
                    if vertex.is_clipped() { " (clipped)" } else { "" }
                );
            }
        }
        QueryTarget::Nearest {
            lat,
            lon,
            radius,
            min_class,
        } => {
            let min_class = match min_class {
                Some(value) => Some(
                    FunctionalClass::from_u8(value)
                        .with_context(|| format!("Unknown functional class: {}", value))?,
                ),
                None => None,
            };
            let location = Location::from_degrees(lat, lon);
            match graph
                .vertex_nearest(&location, radius, min_class)
                .context("Nearest vertex query failed")?
            {
                Some(vertex) => println!(
                    "  {} {} ({:.1}m)",
                    vertex.id(),
                    vertex.location(),
                    vertex.location().distance_to(&location)
                ),
                None => println!("No vertex within {}m", radius),
            }
        }
        QueryTarget::Places { bbox } => {
            let places = graph.places_inside(&bbox).context("Place query failed")?;
            println!("{} places", places.len());
            for place in places {
                println!(
                    "  {} {} pop={} {}",
                    place.id(),
                    place.place.name,
                    place.place.population,
                    place.location()
                );
            }
        }
        QueryTarget::PlaceAt { lat, lon } => {
            let location = Location::from_degrees(lat, lon);
            match graph.place_at(&location).context("Place lookup failed")? {
                Some(place) => println!(
                    "  {} {} pop={}",
                    place.id(),
                    place.place.name,
                    place.place.population
                ),
                None => println!("No place at {}", location),
            }
        }
    }

    Ok(())
}

/// Load every cell
fn cmd_load(config: &GeoshardConfig, workspace: &Path) -> Result<()> {
    let start = Instant::now();
    let graph = open_graph(config, workspace)?;
    let loaded = graph.load_all().context("Failed to load cells")?;
    let stats = graph.stats();

    println!("\nLoad complete!");
    println!("  Cells loaded: {}", loaded);
    println!("  Memory: {} bytes", stats.memory_usage_bytes);
    println!("  Evictions: {}", stats.cache_evictions);
    println!("  Time: {:.2}s", start.elapsed().as_secs_f64());

    Ok(())
}

fn open_graph(config: &GeoshardConfig, workspace: &Path) -> Result<VirtualGraph> {
    VirtualGraph::open(config, workspace)
        .with_context(|| format!("Failed to open dataset {}", config.dataset.name))
}

/// Parse `min_lat,min_lon,max_lat,max_lon`
fn parse_bbox(s: &str) -> Result<Rect<f64>, String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid coordinate: {}", e))?;
    let [min_lat, min_lon, max_lat, max_lon] = values[..] else {
        return Err("expected min_lat,min_lon,max_lat,max_lon".to_string());
    };
    Ok(rect_from_locations(
        Location::from_degrees(min_lat, min_lon),
        Location::from_degrees(max_lat, max_lon),
    ))
}
