use super::provider::EmbeddingProvider;
use crate::error::Result;

/// Feature-hashing embedder over character unigrams and bigrams.
///
/// Deterministic and offline. Texts sharing characters land close together,
/// which is enough for keyword-level retrieval over Chinese text and for
/// exercising the RAG pipeline without an embedding service.
pub struct HashEmbeddingProvider;

const DIMENSIONS: usize = 128;

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self
    }
}

impl HashEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }

    /// FNV-1a over the UTF-8 bytes of a feature.
    fn bucket(feature: &str) -> usize {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in feature.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        (hash % DIMENSIONS as u64) as usize
    }

    fn hash_text(text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; DIMENSIONS];
        let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();

        for c in &chars {
            vec[Self::bucket(&c.to_string())] += 1.0;
        }
        for pair in chars.windows(2) {
            let bigram: String = pair.iter().collect();
            vec[Self::bucket(&bigram)] += 0.5;
        }

        let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::hash_text(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::hash_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    fn model_id(&self) -> &str {
        "hash-128d"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_unit_length_and_deterministic() {
        let p = HashEmbeddingProvider::new();
        let a = p.embed("焦虑的时候怎么办").await.unwrap();
        let b = p.embed("焦虑的时候怎么办").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);
        assert!((dot(&a, &a) - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_shared_characters_score_higher() {
        let p = HashEmbeddingProvider::new();
        let query = p.embed("失眠怎么办").await.unwrap();
        let related = p.embed("长期失眠的人可以尝试规律作息").await.unwrap();
        let unrelated = p.embed("Rust borrow checker").await.unwrap();
        assert!(dot(&query, &related) > dot(&query, &unrelated));
    }

    #[tokio::test]
    async fn test_empty_text_is_zero_vector() {
        let p = HashEmbeddingProvider::new();
        let v = p.embed("   ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
