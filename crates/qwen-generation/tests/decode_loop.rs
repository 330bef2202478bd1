//! Decode loop and prompt enhancement against scripted stub models.

use std::cell::RefCell;
use std::collections::HashSet;

use candle_core::{DType, Device, Tensor};
use qwen_generation::{
    CausalLm, KvCache, PromptEnhanceConfig, StopReason, TokenGenerator, enhance_prompt,
};
use zimage_core::{ChatMessage, ChatTokenizer, ZImageError, ZImageResult};

const VOCAB: usize = 16;
const EOS: u32 = 0;

/// Model that emits `script` in order, then EOS.
///
/// Every call writes one K/V row per input position into each layer cache so
/// cache offsets can be checked from the outside.
struct ScriptedLm {
    device: Device,
    layers: usize,
    script: Vec<u32>,
    /// (input length, cache offset before the call) per forward call.
    calls: RefCell<Vec<(usize, usize)>>,
}

impl ScriptedLm {
    fn new(script: &[u32]) -> Self {
        Self {
            device: Device::Cpu,
            layers: 2,
            script: script.to_vec(),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(usize, usize)> {
        self.calls.borrow().clone()
    }
}

impl CausalLm for ScriptedLm {
    fn num_hidden_layers(&self) -> usize {
        self.layers
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_causal(
        &self,
        input_ids: &Tensor,
        caches: &mut [Box<dyn KvCache>],
    ) -> ZImageResult<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        assert_eq!(caches.len(), self.layers);

        let offset = caches[0].offset();
        for cache in caches.iter_mut() {
            assert_eq!(cache.offset(), offset, "кеши слоёв рассинхронизированы");
            let kv = Tensor::ones((1, 1, seq, 2), DType::F32, &self.device)?;
            let (k, _) = cache.update(&kv, &kv)?;
            assert_eq!(k.dim(2)?, offset + seq);
        }

        let step = {
            let mut calls = self.calls.borrow_mut();
            calls.push((seq, offset));
            calls.len() - 1
        };
        let next = self.script.get(step).copied().unwrap_or(EOS);

        let mut logits = vec![0f32; seq * VOCAB];
        logits[(seq - 1) * VOCAB + next as usize] = 10.0;
        Ok(Tensor::from_vec(logits, (1, seq, VOCAB), &self.device)?)
    }
}

fn greedy_config(max_new_tokens: usize) -> PromptEnhanceConfig {
    PromptEnhanceConfig {
        max_new_tokens,
        temperature: 0.0,
        repetition_penalty: None,
        eos_token_id: EOS,
        stop_token_ids: HashSet::new(),
        ..PromptEnhanceConfig::default()
    }
}

#[test]
fn eos_on_first_step_yields_empty_output() {
    let model = ScriptedLm::new(&[]);
    let mut generator = TokenGenerator::new(0);

    let (tokens, reason) = generator
        .generate_with_reason(&model, &[5, 6, 7], &greedy_config(8))
        .unwrap();

    assert!(tokens.is_empty());
    assert_eq!(reason, StopReason::Eos);
    assert_eq!(model.calls(), vec![(3, 0)], "только prefill");
}

#[test]
fn max_new_tokens_is_a_hard_bound() {
    let model = ScriptedLm::new(&[3, 4, 5, 6, 7, 8, 9]);
    let mut generator = TokenGenerator::new(0);

    let (tokens, reason) = generator
        .generate_with_reason(&model, &[1, 2], &greedy_config(4))
        .unwrap();

    assert_eq!(tokens, vec![3, 4, 5, 6]);
    assert_eq!(reason, StopReason::MaxTokens);
    // prefill + 3 decode-шага; после последнего токена forward не нужен.
    assert_eq!(model.calls().len(), 4);
}

#[test]
fn decode_steps_reuse_caches_with_single_tokens() {
    let model = ScriptedLm::new(&[9, 10, 11]);
    let mut generator = TokenGenerator::new(0);

    let tokens = generator
        .generate(&model, &[1, 2, 3, 4, 5], &greedy_config(16))
        .unwrap();

    assert_eq!(tokens, vec![9, 10, 11]);
    assert_eq!(model.calls(), vec![(5, 0), (1, 5), (1, 6), (1, 7)]);
}

#[test]
fn stop_set_token_is_not_appended() {
    let model = ScriptedLm::new(&[3, 12, 4]);
    let mut generator = TokenGenerator::new(0);
    let config = PromptEnhanceConfig {
        stop_token_ids: [12].into_iter().collect(),
        ..greedy_config(16)
    };

    let (tokens, reason) = generator
        .generate_with_reason(&model, &[1], &config)
        .unwrap();

    assert_eq!(tokens, vec![3]);
    assert_eq!(reason, StopReason::Eos);
}

#[test]
fn invalid_config_is_rejected_before_prefill() {
    let model = ScriptedLm::new(&[3]);
    let mut generator = TokenGenerator::new(0);
    let config = PromptEnhanceConfig {
        temperature: -1.0,
        ..greedy_config(4)
    };

    let err = generator.generate(&model, &[1, 2], &config).unwrap_err();
    assert!(matches!(err, ZImageError::Config(_)));
    assert!(model.calls().is_empty());
}

#[test]
fn greedy_decoding_accepts_zero_top_p() {
    let model = ScriptedLm::new(&[3, 4]);
    let mut generator = TokenGenerator::new(0);
    let config = PromptEnhanceConfig {
        top_p: 0.0,
        ..greedy_config(8)
    };

    let (tokens, reason) = generator
        .generate_with_reason(&model, &[1, 2], &config)
        .unwrap();

    assert_eq!(tokens, vec![3, 4]);
    assert_eq!(reason, StopReason::Eos);
}

#[test]
fn empty_prompt_is_rejected() {
    let model = ScriptedLm::new(&[3]);
    let err = TokenGenerator::new(0)
        .generate(&model, &[], &greedy_config(4))
        .unwrap_err();
    assert!(matches!(err, ZImageError::Config(_)));
}

/// Model with flat logits: every token equally likely.
struct UniformLm {
    device: Device,
}

impl CausalLm for UniformLm {
    fn num_hidden_layers(&self) -> usize {
        1
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward_causal(
        &self,
        input_ids: &Tensor,
        _caches: &mut [Box<dyn KvCache>],
    ) -> ZImageResult<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        Ok(Tensor::zeros((1, seq, VOCAB), DType::F32, &self.device)?)
    }
}

#[test]
fn seeded_sampling_is_reproducible() {
    let model = UniformLm {
        device: Device::Cpu,
    };
    let config = PromptEnhanceConfig {
        max_new_tokens: 24,
        eos_token_id: 1000,
        stop_token_ids: HashSet::new(),
        ..PromptEnhanceConfig::default()
    };

    let a = TokenGenerator::new(42).generate(&model, &[1, 2], &config).unwrap();
    let b = TokenGenerator::new(42).generate(&model, &[1, 2], &config).unwrap();

    assert_eq!(a.len(), 24);
    assert_eq!(a, b);
    assert!(a.iter().all(|&t| (t as usize) < VOCAB));
}

struct StubTokenizer {
    eos: Option<u32>,
    seen: RefCell<Vec<ChatMessage>>,
}

impl ChatTokenizer for StubTokenizer {
    fn encode_chat_for_generation(
        &self,
        messages: &[ChatMessage],
        _max_length: usize,
    ) -> ZImageResult<Vec<u32>> {
        self.seen.borrow_mut().extend_from_slice(messages);
        Ok(vec![1, 2, 3])
    }

    fn encode_prompt(&self, _prompt: &str, _max_length: usize) -> ZImageResult<Vec<u32>> {
        Ok(vec![1])
    }

    fn decode(&self, token_ids: &[u32]) -> ZImageResult<String> {
        Ok(token_ids
            .iter()
            .map(|&id| match id {
                3 => "<think>",
                4 => "hmm",
                5 => "</think>",
                6 => " a fox ",
                7 => "in snow",
                _ => "?",
            })
            .collect())
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }

    fn max_length(&self) -> usize {
        512
    }
}

#[test]
fn enhance_strips_think_and_uses_tokenizer_eos() {
    // 9: eos токенайзера; в конфиге eos другой.
    let model = ScriptedLm::new(&[3, 4, 5, 6, 7, 9, 4]);
    let tokenizer = StubTokenizer {
        eos: Some(9),
        seen: RefCell::new(Vec::new()),
    };
    let config = PromptEnhanceConfig {
        eos_token_id: 15,
        ..greedy_config(32)
    };

    let enhanced = enhance_prompt(&model, &tokenizer, "лиса", &config).unwrap();
    assert_eq!(enhanced, "a fox in snow");

    let seen = tokenizer.seen.borrow();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].role, "system");
    assert_eq!(seen[1], ChatMessage::user("用户输入 prompt: лиса"));
}

#[test]
fn enhance_returns_empty_for_unterminated_think() {
    let model = ScriptedLm::new(&[3, 4, 4, 4]);
    let tokenizer = StubTokenizer {
        eos: None,
        seen: RefCell::new(Vec::new()),
    };

    let enhanced = enhance_prompt(&model, &tokenizer, "fox", &greedy_config(32)).unwrap();
    assert_eq!(enhanced, "");
}
