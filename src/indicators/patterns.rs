use rust_decimal::Decimal;

use crate::types::Candle;

/// Pattern series: +1 bullish completion at the bar, -1 bearish, 0 none.
pub fn engulfing_series(candles: &[Candle]) -> Vec<i8> {
    let mut out = vec![0i8; candles.len()];
    for i in 1..candles.len() {
        let prev = &candles[i - 1];
        let curr = &candles[i];
        if curr.is_bullish()
            && prev.is_bearish()
            && curr.open <= prev.close
            && curr.close >= prev.open
            && curr.body_size() > prev.body_size()
        {
            out[i] = 1;
        } else if curr.is_bearish()
            && prev.is_bullish()
            && curr.open >= prev.close
            && curr.close <= prev.open
            && curr.body_size() > prev.body_size()
        {
            out[i] = -1;
        }
    }
    out
}

/// Hammer (+1) and hanging-man-shaped inverted variant (-1): long lower wick,
/// small body near the top of the range.
pub fn hammer_series(candles: &[Candle]) -> Vec<i8> {
    let mut out = vec![0i8; candles.len()];
    let two = Decimal::from(2);
    for (i, candle) in candles.iter().enumerate() {
        let body = candle.body_size();
        if body.is_zero() {
            continue;
        }
        if candle.lower_wick() >= body * two && candle.upper_wick() < body {
            out[i] = 1;
        } else if candle.upper_wick() >= body * two && candle.lower_wick() < body {
            out[i] = -1;
        }
    }
    out
}

/// Doji after a directional bar: bullish after a decline, bearish after an
/// advance.
pub fn doji_series(candles: &[Candle]) -> Vec<i8> {
    let mut out = vec![0i8; candles.len()];
    for i in 1..candles.len() {
        if !candles[i].is_doji() {
            continue;
        }
        if candles[i - 1].is_bearish() {
            out[i] = 1;
        } else if candles[i - 1].is_bullish() {
            out[i] = -1;
        }
    }
    out
}

/// Three-bar morning star (+1) / evening star (-1).
pub fn morning_star_series(candles: &[Candle]) -> Vec<i8> {
    let mut out = vec![0i8; candles.len()];
    let two = Decimal::from(2);
    for i in 2..candles.len() {
        let first = &candles[i - 2];
        let star = &candles[i - 1];
        let third = &candles[i];
        let small_star = star.body_size() * two < first.body_size();

        if first.is_bearish()
            && small_star
            && third.is_bullish()
            && third.close > (first.open + first.close) / two
        {
            out[i] = 1;
        } else if first.is_bullish()
            && small_star
            && third.is_bearish()
            && third.close < (first.open + first.close) / two
        {
            out[i] = -1;
        }
    }
    out
}
