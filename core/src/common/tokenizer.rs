use std::path::Path;

use anyhow::{anyhow, Result};
use tokenizers::Tokenizer;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Turns text into token ids. Ids are unbounded; the model folds them into its
/// vocabulary.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}

/// Lowercased alphanumeric words.
pub fn normalized_words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Hashes every normalized word with FNV-1a, so ids are stable across
/// processes, platforms and releases.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashedTokenizer;

impl HashedTokenizer {
    fn hash(word: &str) -> u32 {
        word.bytes()
            .fold(FNV_OFFSET, |h, b| (h ^ b as u32).wrapping_mul(FNV_PRIME))
    }
}

impl TextTokenizer for HashedTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(normalized_words(text).map(|w| Self::hash(&w)).collect())
    }
}

/// HuggingFace `tokenizer.json`.
pub struct PretrainedTokenizer {
    inner: Tokenizer,
}

impl PretrainedTokenizer {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref()).map_err(|e| {
            tracing::error!("Failed to load tokenizer:{}", e);
            anyhow!("{}", e)
        })?;
        Ok(Self { inner })
    }
}

impl TextTokenizer for PretrainedTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow!("{}", e))?;
        Ok(encoding.get_ids().to_vec())
    }
}

/// Uses `<cache_dir>/tokenizer.json` when it exists, the hashed tokenizer
/// otherwise.
pub fn load_tokenizer(cache_dir: &Path) -> Result<Box<dyn TextTokenizer>> {
    let path = cache_dir.join("tokenizer.json");
    if path.is_file() {
        tracing::info!("using tokenizer {}", path.display());
        return Ok(Box::new(PretrainedTokenizer::from_file(path)?));
    }
    tracing::debug!(
        "no tokenizer.json in {}, falling back to hashed words",
        cache_dir.display()
    );
    Ok(Box::new(HashedTokenizer))
}

#[test]
fn test_normalized_words() {
    let words: Vec<String> = normalized_words("The cat's HAT, 2 times!").collect();
    assert_eq!(words, vec!["the", "cat", "s", "hat", "2", "times"]);
}

#[test]
fn test_hashed_tokenizer_is_stable() -> Result<()> {
    let tokenizer = HashedTokenizer;
    let a = tokenizer.encode("Hello, world")?;
    let b = tokenizer.encode("hello WORLD")?;
    assert_eq!(a, b);
    assert_eq!(a.len(), 2);
    // FNV-1a/32 of "a"
    assert_eq!(tokenizer.encode("a")?, vec![0xe40c_292c]);
    Ok(())
}

#[test]
fn test_fallback_without_tokenizer_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let tokenizer = load_tokenizer(dir.path())?;
    assert_eq!(tokenizer.encode("x y z")?.len(), 3);
    Ok(())
}
