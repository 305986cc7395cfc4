//! Lexical review analysis
//!
//! Sentiment is the balance of positive and negative lexicon hits; keywords
//! are the most frequent product-aspect terms and Latin words. Both are pure
//! functions of their input.

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;

pub const MAX_KEYWORDS: usize = 8;

const POSITIVE_TERMS: &[&str] = &[
    "好评", "满意", "喜欢", "不错", "推荐", "流畅", "清晰", "漂亮", "好看", "好用", "值得", "超值", "划算", "耐用",
    "正品", "精致", "舒服", "给力", "完美", "惊喜", "很快", "好", "棒", "赞", "快", "good", "great", "excellent",
    "love", "nice", "perfect", "recommend", "smooth",
];

/// Includes negated positives so "不好" is not read as "好"
const NEGATIVE_TERMS: &[&str] = &[
    "不好", "不满意", "不喜欢", "不流畅", "不清晰", "不值", "不推荐", "不行", "差评", "失望", "垃圾", "退货", "后悔",
    "发热", "发烫", "卡顿", "掉帧", "假货", "质量差", "太慢", "问题", "坏了", "差", "卡", "慢", "烂", "bad",
    "poor", "broken", "terrible", "slow", "refund", "disappointed",
];

/// Product aspects worth surfacing from Chinese review text
const ASPECT_TERMS: &[&str] = &[
    "性价比", "续航", "电池", "屏幕", "拍照", "像素", "摄像头", "系统", "信号", "充电", "快充", "发热", "音质", "手感",
    "外观", "颜值", "做工", "质量", "速度", "运行", "内存", "存储", "物流", "快递", "包装", "客服", "价格", "售后",
    "配件", "耳机", "散热", "游戏", "指纹", "面部识别", "屏幕显示", "重量",
];

lazy_static! {
    static ref STOPWORDS: HashSet<&'static str> = [
        "the", "and", "for", "with", "this", "that", "was", "are", "is", "it", "its", "but", "not", "very", "too",
        "have", "has", "had", "you", "my", "me", "so", "of", "to", "in", "on", "at", "an", "as", "be", "by", "or",
        "we", "they", "them", "from", "just", "really", "all", "can", "will",
    ]
    .into_iter()
    .collect();

    /// Sentiment lexicon, longest terms first so negations win
    static ref LEXICON: Vec<(&'static str, i32)> = {
        let mut terms: Vec<(&'static str, i32)> = POSITIVE_TERMS
            .iter()
            .map(|term| (*term, 1))
            .chain(NEGATIVE_TERMS.iter().map(|term| (*term, -1)))
            .collect();
        terms.sort_by(|a, b| b.0.chars().count().cmp(&a.0.chars().count()));
        terms
    };

    static ref ASPECTS: Vec<&'static str> = {
        let mut terms = ASPECT_TERMS.to_vec();
        terms.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
        terms
    };
}

/// Greedy left-to-right longest match of `terms` over `text`
fn scan<'a, T: Copy>(text: &str, terms: &'a [(&'static str, T)]) -> Vec<(&'a str, T)> {
    let mut hits = Vec::new();
    let mut rest = text;
    while let Some(first) = rest.chars().next() {
        if let Some(&(term, tag)) = terms.iter().find(|(term, _)| rest.starts_with(term)) {
            hits.push((term, tag));
            rest = &rest[term.len()..];
        } else {
            rest = &rest[first.len_utf8()..];
        }
    }
    hits
}

/// Sentiment in [-1.0, 1.0]; 0.0 when the text carries no lexicon terms
pub fn sentiment_score(text: &str) -> f64 {
    let lowered = text.to_lowercase();
    let hits = scan(&lowered, LEXICON.as_slice());
    if hits.is_empty() {
        return 0.0;
    }

    let positive = hits.iter().filter(|(_, polarity)| *polarity > 0).count() as f64;
    let negative = hits.len() as f64 - positive;
    let score = (positive - negative) / (positive + negative);
    (score * 100.0).round() / 100.0
}

/// Up to `limit` distinct keywords across `texts`, most frequent first
pub fn extract_keywords(texts: &[&str], limit: usize) -> Vec<String> {
    let aspects: Vec<(&str, ())> = ASPECTS.iter().map(|term| (*term, ())).collect();
    // keyword -> (count, first position)
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut position = 0;

    let mut record = |word: String, counts: &mut HashMap<String, (usize, usize)>| {
        let entry = counts.entry(word).or_insert((0, position));
        entry.0 += 1;
        position += 1;
    };

    for text in texts {
        let lowered = text.to_lowercase();
        for (term, ()) in scan(&lowered, aspects.as_slice()) {
            record(term.to_string(), &mut counts);
        }
        for word in lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|word| word.len() >= 3 && !word.chars().all(|c| c.is_ascii_digit()))
            .filter(|word| !STOPWORDS.contains(word))
        {
            record(word.to_string(), &mut counts);
        }
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
        count_b.cmp(count_a).then(first_a.cmp(first_b))
    });
    ranked.into_iter().take(limit).map(|(word, _)| word).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("手机很好用，屏幕清晰，推荐购买", 1.0)]
    #[case("质量差，用了两天就卡顿，失望", -1.0)]
    #[case("物流一般", 0.0)]
    #[case("外观不错但是发热严重", 0.0)]
    #[case("Great phone, but battery is poor and slow", -0.33)]
    fn test_sentiment_score(#[case] text: &str, #[case] expected: f64) {
        assert_eq!(sentiment_score(text), expected);
    }

    #[test]
    fn test_negation_is_not_counted_as_praise() {
        assert_eq!(sentiment_score("不好"), -1.0);
        assert_eq!(sentiment_score("不推荐，不满意"), -1.0);
    }

    #[test]
    fn test_keywords_rank_by_frequency_then_first_appearance() {
        let keywords = extract_keywords(&["屏幕很好，电池一般", "续航不错，电池耐用", "the camera and the camera"], 3);
        assert_eq!(keywords, vec!["电池", "camera", "屏幕"]);
    }

    #[test]
    fn test_keywords_skip_stopwords_and_numbers() {
        let keywords = extract_keywords(&["this was 128 GB and it is really fast"], MAX_KEYWORDS);
        assert_eq!(keywords, vec!["fast"]);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let text = "拍照清晰，续航给力，系统流畅，快递很快";
        assert_eq!(extract_keywords(&[text], 5), extract_keywords(&[text], 5));
        assert_eq!(sentiment_score(text), sentiment_score(text));
    }
}
