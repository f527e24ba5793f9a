// 均线与成交量指标验证
// 用于验证 K 线图各指标序列的计算正确性

use crate::command::PricePoint;
use crate::indicators::{
    VolumeDirection, compute_moving_average, compute_volume_bars, latest_defined, validate_window,
};

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn bars(closes: &[f64]) -> Vec<PricePoint> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &close)| {
                let open = if i % 3 == 0 { close - 0.1 } else { close + 0.1 };
                PricePoint::new(
                    start + chrono::Days::new(i as u64),
                    open,
                    close.max(open) + 0.2,
                    close.min(open) - 0.2,
                    close,
                    10_000 + i as u64 * 100,
                )
            })
            .collect()
    }

    const CLOSES: [f64; 20] = [
        22.27, 22.19, 22.08, 22.17, 22.18, 22.13, 22.23, 22.43, 22.24, 22.29, 22.15, 22.39,
        22.38, 22.61, 23.36, 24.05, 23.75, 23.83, 23.95, 23.63,
    ];

    // 测试 MA5 计算
    #[test]
    fn test_ma5_calculation() {
        let prices = bars(&CLOSES);
        let ma5 = compute_moving_average(5, &prices);

        assert_eq!(ma5.name, "MA5");
        // 序列长度应与价格序列一致
        assert_eq!(ma5.len(), prices.len());

        // 前 4 个位置没有足够的回看窗口
        assert!(ma5.values[..4].iter().all(Option::is_none));

        // 第 5 个位置等于前 5 个收盘价的均值
        let expected = CLOSES[..5].iter().sum::<f64>() / 5.0;
        let actual = ma5.values[4].unwrap();
        assert!((actual - expected).abs() < 1e-9, "MA5[4] = {actual}");

        // 每个已定义的值都是其尾部窗口的均值
        for (idx, value) in ma5.defined() {
            let window = &CLOSES[idx + 1 - 5..=idx];
            let mean = window.iter().sum::<f64>() / 5.0;
            assert!((value - mean).abs() < 1e-9, "MA5[{idx}] = {value}, want {mean}");
        }
    }

    #[test]
    fn test_ma20_on_exact_window() {
        let prices = bars(&CLOSES);
        let ma20 = compute_moving_average(20, &prices);

        // 只有最后一个位置有值
        assert_eq!(ma20.defined().count(), 1);
        let expected = CLOSES.iter().sum::<f64>() / 20.0;
        let last = latest_defined(&ma20.values).unwrap();
        assert!((last - expected).abs() < 1e-9);
    }

    #[test]
    fn test_short_series_has_no_values() {
        let prices = bars(&CLOSES[..3]);
        let ma5 = compute_moving_average(5, &prices);
        assert_eq!(ma5.len(), 3);
        assert!(ma5.values.iter().all(Option::is_none));
        assert_eq!(latest_defined(&ma5.values), None);

        let empty = compute_moving_average(5, &[]);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_invalid_window() {
        assert!(validate_window(0).is_err());
        assert_eq!(validate_window(10), Ok(10));
        // 窗口为 0 时不会除零, 整列都没有值
        let prices = bars(&CLOSES[..5]);
        let ma0 = compute_moving_average(0, &prices);
        assert!(ma0.values.iter().all(Option::is_none));
    }

    #[test]
    fn test_input_is_untouched() {
        let prices = bars(&CLOSES);
        let before = prices.clone();
        let first = compute_moving_average(5, &prices);
        let second = compute_moving_average(5, &prices);
        assert_eq!(prices, before);
        assert_eq!(first, second);
    }

    // 测试成交量涨跌着色
    #[test]
    fn test_volume_direction() {
        let prices = bars(&CLOSES[..6]);
        let volume = compute_volume_bars(&prices);
        assert_eq!(volume.len(), prices.len());
        for (bar, point) in volume.iter().zip(&prices) {
            assert_eq!(bar.volume, point.volume);
            let expected = if point.close > point.open {
                VolumeDirection::Up
            } else {
                VolumeDirection::Down
            };
            assert_eq!(bar.direction, expected);
        }
        // 开盘价低于收盘价的是阳线
        assert_eq!(volume[0].direction, VolumeDirection::Up);
        assert_eq!(volume[1].direction, VolumeDirection::Down);

        // 平盘计为下跌
        let flat = PricePoint::new(
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            10.0,
            10.5,
            9.5,
            10.0,
            500,
        );
        assert_eq!(
            compute_volume_bars(&[flat])[0].direction,
            VolumeDirection::Down
        );
    }
}
