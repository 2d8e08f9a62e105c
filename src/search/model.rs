use crate::core::config::Config;
use crate::core::error::{Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;
use tracing::info;

/// Default embedding model: CLIP ViT-B/32, shared image/text space
/// https://huggingface.co/openai/clip-vit-base-patch32
const DEFAULT_MODEL: &str = "openai/clip-vit-base-patch32";

/// Revision carrying the safetensors weights
const DEFAULT_REVISION: &str = "refs/pr/15";

/// Identifier for the embedding model used to build/query the index.
/// If this changes, cached embeddings are discarded.
pub const EMBEDDING_MODEL_ID: &str = "openai/clip-vit-base-patch32@refs/pr/15";

/// CLIP text encoder context length
const MAX_TEXT_TOKENS: usize = 77;

/// Maps images and text queries into one vector space.
///
/// Implementations must be deterministic: the same input always yields the
/// same vector, with the same dimension for images and text.
pub trait Embedder: Send + Sync {
    /// Identifies the model; a change invalidates cached embeddings
    fn model_id(&self) -> &str;

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// CLIP embedding model backed by candle
pub struct ClipEmbedder {
    model: Arc<Mutex<ClipModel>>,
    tokenizer: Arc<Tokenizer>,
    config: ClipConfig,
    device: Device,
}

impl ClipEmbedder {
    /// Load the model, downloading it into the models directory on first use
    pub fn init(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.models_dir)?;

        let model_path = config.models_dir.join("clip.safetensors");
        let tokenizer_path = config.models_dir.join("clip-tokenizer.json");

        if !model_path.exists() || !tokenizer_path.exists() {
            Self::download_model(&model_path, &tokenizer_path)?;
        }

        Self::load_model_files(&model_path, &tokenizer_path)
    }

    /// Download model from HuggingFace Hub
    fn download_model(model_path: &PathBuf, tokenizer_path: &PathBuf) -> Result<()> {
        info!("Downloading embedding model {} from HuggingFace Hub", DEFAULT_MODEL);

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            DEFAULT_MODEL.to_string(),
            RepoType::Model,
            DEFAULT_REVISION.to_string(),
        ));

        let tokenizer_file = repo.get("tokenizer.json")?;
        info!("Downloading model.safetensors (this may take a while)");
        let weights_file = repo.get("model.safetensors")?;

        std::fs::copy(&tokenizer_file, tokenizer_path)?;
        std::fs::copy(&weights_file, model_path)?;

        info!("Model downloaded successfully");
        Ok(())
    }

    /// Load model files from disk
    fn load_model_files(model_path: &PathBuf, tokenizer_path: &PathBuf) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| Error::Tokenizer(format!("Failed to load tokenizer: {}", e)))?;

        let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
        let config = ClipConfig::vit_base_patch32();

        // Load model weights using memory mapping
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[model_path], DType::F32, &device)
                .map_err(|e| Error::Model(format!("Failed to load weights: {}", e)))?
        };
        let model = ClipModel::new(vb, &config)
            .map_err(|e| Error::Model(format!("Failed to load model: {}", e)))?;

        info!("Model loaded on {:?}", device);

        Ok(Self {
            model: Arc::new(Mutex::new(model)),
            tokenizer: Arc::new(tokenizer),
            config,
            device,
        })
    }

    /// Decode, resize and scale an image to a `[1, 3, H, W]` tensor in [-1, 1]
    fn image_tensor(&self, path: &Path) -> Result<Tensor> {
        let size = self.config.image_size;
        let img = image::ImageReader::open(path)?
            .with_guessed_format()?
            .decode()?
            .resize_to_fill(
                size as u32,
                size as u32,
                image::imageops::FilterType::Triangle,
            )
            .to_rgb8()
            .into_raw();

        let tensor = Tensor::from_vec(img, (size, size, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(2. / 255., -1.)?
            .unsqueeze(0)?
            .to_device(&self.device)?;
        Ok(tensor)
    }

    fn features_to_vec(features: Tensor) -> Result<Vec<f32>> {
        Ok(features.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

impl Embedder for ClipEmbedder {
    fn model_id(&self) -> &str {
        EMBEDDING_MODEL_ID
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>> {
        let pixels = self.image_tensor(path).map_err(|e| Error::Embedding {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let model = self
            .model
            .lock()
            .map_err(|e| Error::Model(format!("Failed to lock model: {}", e)))?;
        let features = model.get_image_features(&pixels)?;
        Self::features_to_vec(features)
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| Error::Tokenizer(format!("Tokenization failed: {}", e)))?;

        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        ids.truncate(MAX_TEXT_TOKENS);
        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;

        let model = self
            .model
            .lock()
            .map_err(|e| Error::Model(format!("Failed to lock model: {}", e)))?;
        let features = model.get_text_features(&input_ids)?;
        Self::features_to_vec(features)
    }
}
