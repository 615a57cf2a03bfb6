use crate::models::Pricing;

/**
 * \brief 估算单次调用费用：价格按每千 token 计。
 * \details 未提供价格时费用为 0；不做舍入，展示时再格式化。
 */
pub fn estimate_cost(pricing: Option<&Pricing>, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    let Some(pricing) = pricing else {
        return 0.0;
    };
    let prompt_cost = pricing.prompt * prompt_tokens as f64 / 1000.0;
    let completion_cost = pricing.completion * completion_tokens as f64 / 1000.0;
    prompt_cost + completion_cost
}

/**
 * \brief 展示用格式：保留 6 位小数。
 */
pub fn format_cost(cost: f64) -> String {
    format!("${:.6}", cost)
}

/**
 * \brief 粗略估算 token 数（约 4 字符 1 token）。
 */
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_formula() {
        let pricing = Pricing {
            prompt: 0.5,
            completion: 1.5,
        };
        let cost = estimate_cost(Some(&pricing), 2000, 1000);
        assert!((cost - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_cost_without_pricing_is_zero() {
        assert_eq!(estimate_cost(None, 123_456, 789), 0.0);
    }

    #[test]
    fn test_zero_tokens_cost_nothing() {
        let pricing = Pricing {
            prompt: 3.0,
            completion: 15.0,
        };
        assert_eq!(estimate_cost(Some(&pricing), 0, 0), 0.0);
    }

    #[test]
    fn test_stored_value_keeps_precision() {
        let pricing = Pricing {
            prompt: 0.000_001,
            completion: 0.0,
        };
        let cost = estimate_cost(Some(&pricing), 1, 0);
        assert!(cost > 0.0 && cost < 1e-8);
        assert_eq!(format_cost(cost), "$0.000000");
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
