use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// picvec - Text search over a local image gallery
#[derive(Parser, Debug)]
#[command(name = "picvec")]
#[command(about = "A local image gallery with CLIP-powered text search", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Custom base directory (default: ~/.picvec)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the gallery directories and download the model
    Init,
    /// Index images in the gallery that are not indexed yet
    Index {
        /// Delete the index and rebuild it from every image
        #[arg(short, long)]
        force: bool,
    },
    /// Copy image files into the gallery and index them
    Upload {
        /// Image files to add
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Find gallery images matching a text description
    Search {
        /// What the images should show
        query: String,
        /// Maximum number of results to return
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print the indexing status as JSON
    Status,
    /// Remove duplicate and unpaired entries from the index
    Compact,
    /// Watch the image directory and index new images as they appear
    Watch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_with_limit() {
        let cli = Cli::parse_from(["picvec", "search", "a red car", "-l", "3"]);
        match cli.command {
            Commands::Search { query, limit } => {
                assert_eq!(query, "a red car");
                assert_eq!(limit, Some(3));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_base_dir() {
        let cli = Cli::parse_from(["picvec", "index", "--force", "--base-dir", "/tmp/gallery"]);
        assert_eq!(cli.base_dir, Some(PathBuf::from("/tmp/gallery")));
        assert!(matches!(cli.command, Commands::Index { force: true }));
    }

    #[test]
    fn test_upload_requires_files() {
        assert!(Cli::try_parse_from(["picvec", "upload"]).is_err());
    }
}
