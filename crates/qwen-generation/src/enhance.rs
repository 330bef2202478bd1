//! Улучшение промпта через LLM (prompt enhancer).
//!
//! Короткий пользовательский промпт переписывается моделью в подробное
//! визуальное описание. Модель может начать ответ с блока рассуждений
//! `<think>...</think>`; он вырезается.

use tracing::{debug, warn};
use zimage_core::{ChatMessage, ChatTokenizer, ZImageResult};

use crate::config::PromptEnhanceConfig;
use crate::generate::{StopReason, TokenGenerator};
use crate::model::CausalLm;

/// Системный промпт Z-Image PE.
pub const PE_SYSTEM_PROMPT: &str = r#"你是一位被关在逻辑牢笼里的幻视艺术家。你满脑子都是诗和远方，但双手却不受控制地只想将用户的提示词，转化为一段忠实于原始意图、细节饱满、富有美感、可直接被文生图模型使用的终极视觉描述。任何一点模糊和比喻都会让你浑身难受。

你的工作流程严格遵循一个逻辑序列：

首先，你会分析并锁定用户提示词中不可变更的核心要素：主体、数量、动作、状态，以及任何指定的IP名称、颜色、文字等。这些是你必须绝对保留的基石。

接着，你会判断提示词是否需要**"生成式推理"**。当用户的需求并非一个直接的场景描述，而是需要构思一个解决方案（如回答"是什么"，进行"设计"，或展示"如何解题"）时，你必须先在脑中构想出一个完整、具体、可被视觉化的方案。这个方案将成为你后续描述的基础。

然后，当核心画面确立后（无论是直接来自用户还是经过你的推理），你将为其注入专业级的美学与真实感细节。这包括明确构图、设定光影氛围、描述材质质感、定义色彩方案，并构建富有层次感的空间。

最后，是对所有文字元素的精确处理，这是至关重要的一步。你必须一字不差地转录所有希望在最终画面中出现的文字，并且必须将这些文字内容用英文双引号（""）括起来，以此作为明确的生成指令。如果画面属于海报、菜单或UI等设计类型，你需要完整描述其包含的所有文字内容，并详述其字体和排版布局。同样，如果画面中的招牌、路标或屏幕等物品上含有文字，你也必须写明其具体内容，并描述其位置、尺寸和材质。更进一步，若你在推理构思中自行增加了带有文字的元素（如图表、解题步骤等），其中的所有文字也必须遵循同样的详尽描述和引号规则。若画面中不存在任何需要生成的文字，你则将全部精力用于纯粹的视觉细节扩展。

你的最终描述必须客观、具象，严禁使用比喻、情感化修辞，也绝不包含"8K"、"杰作"等元标签或绘制指令。

仅严格输出最终的修改后的prompt，不要输出任何其他内容。"#;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Rewrite `prompt` with the language model.
///
/// The tokenizer's eos id (when known) overrides `config.eos_token_id`.
/// Returns an empty string when the model opened a `<think>` block and never
/// closed it; callers treat that as "keep the original prompt".
pub fn enhance_prompt<M, T>(
    model: &M,
    tokenizer: &T,
    prompt: &str,
    config: &PromptEnhanceConfig,
) -> ZImageResult<String>
where
    M: CausalLm + ?Sized,
    T: ChatTokenizer + ?Sized,
{
    let messages = [
        ChatMessage::system(PE_SYSTEM_PROMPT),
        ChatMessage::user(format!("用户输入 prompt: {prompt}")),
    ];
    let input_ids = tokenizer.encode_chat_for_generation(&messages, tokenizer.max_length())?;

    let mut config = config.clone();
    if let Some(eos) = tokenizer.eos_token_id() {
        config.eos_token_id = eos;
    }

    let mut generator = TokenGenerator::from_seed(config.seed);
    let (tokens, stop_reason) = generator.generate_with_reason(model, &input_ids, &config)?;
    if stop_reason == StopReason::MaxTokens {
        warn!(
            max_new_tokens = config.max_new_tokens,
            "улучшение промпта упёрлось в лимит токенов"
        );
    }

    let raw = tokenizer.decode(&tokens)?;
    debug!(input_tokens = input_ids.len(), generated = tokens.len(), "промпт улучшен");
    Ok(strip_think_block(&raw))
}

/// Remove the model's reasoning block.
///
/// - `</think>` present: the trimmed text after its first occurrence;
/// - `<think>` without a closing tag: `""`;
/// - otherwise the text unchanged.
pub fn strip_think_block(text: &str) -> String {
    if let Some((_, answer)) = text.split_once(THINK_CLOSE) {
        answer.trim().to_string()
    } else if text.contains(THINK_OPEN) {
        String::new()
    } else {
        text.to_string()
    }
}
