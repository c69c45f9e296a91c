/// 加权随机选择器
///
/// 按累计权重成比例地随机取样。规模预期在几十个以内，
/// O(n) 的添加和选取足够
use rand::Rng;

pub struct RandomWeighted<T> {
    items: Vec<(T, u32)>,
    total: u64,
}

impl<T: Clone> RandomWeighted<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }

    /// 添加一个候选项，权重为 0 的候选不会被选中
    pub fn add(&mut self, item: T, weight: u32) {
        self.total += weight as u64;
        self.items.push((item, weight));
    }

    /// 清空所有候选项
    pub fn reset(&mut self) {
        self.items.clear();
        self.total = 0;
    }

    /// 按权重随机选取一项；没有可选项时返回 None
    pub fn next(&self) -> Option<T> {
        if self.total == 0 {
            return None;
        }
        let mut point = rand::thread_rng().gen_range(0..self.total);
        for (item, weight) in &self.items {
            let w = *weight as u64;
            if point < w {
                return Some(item.clone());
            }
            point -= w;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Clone> Default for RandomWeighted<T> {
    fn default() -> Self {
        Self::new()
    }
}
