use core::f64;

use candle_core::{D, Result, Tensor};

const LN_2PI: f64 = 1.8378770664093453;

/// Numerically stable softplus: `relu(x) + log(1 + exp(-|x|))`
///
/// Used by every positive-sigma head so that standard deviations stay
/// strictly positive without overflowing for large pre-activations.
pub fn softplus(x_ntd: &Tensor) -> Result<Tensor> {
    let linear_part = x_ntd.relu()?;
    let exp_part = (x_ntd.abs()?.neg()?.exp()? + 1.0)?.log()?;
    linear_part.add(&exp_part)
}

/// Keep or pre-sum the feature axis depending on `reduce_sum`.
///
/// With `reduce_sum = false` the feature axis survives so that callers can
/// mask before reducing; with `true` it is summed with keepdim, giving
/// (n x t x 1).
fn reduce_features(logli_ntd: Tensor, reduce_sum: bool) -> Result<Tensor> {
    if reduce_sum {
        logli_ntd.sum_keepdim(D::Minus1)
    } else {
        Ok(logli_ntd)
    }
}

/// Log density of an isotropic (diagonal) Gaussian
///
/// log N(x; mu, sigma^2) = -0.5*log(2*pi) - log(sigma) - 0.5*((x - mu)/sigma)^2
///
/// The 2*pi normalization constant is always included; every Gaussian-family
/// likelihood in this module follows the same convention so that bound
/// values are comparable across output configurations.
///
/// * `x_ntd` - target tensor (n x t x d)
/// * `mu_ntd` - mean tensor
/// * `sigma_ntd` - standard deviation, must be positive
pub fn logli_normal_isotropic(
    x_ntd: &Tensor,
    mu_ntd: &Tensor,
    sigma_ntd: &Tensor,
    reduce_sum: bool,
) -> Result<Tensor> {
    let z_ntd = x_ntd.sub(mu_ntd)?.div(sigma_ntd)?;
    let logli = ((z_ntd.sqr()? * 0.5)?.neg()? - sigma_ntd.log()?)?;
    reduce_features((logli - 0.5 * LN_2PI)?, reduce_sum)
}

/// Log density of a correlated bivariate Gaussian
///
/// * `x_nt2` - target tensor (n x t x 2)
/// * `mu_nt2` - mean tensor (n x t x 2)
/// * `sigma_nt2` - per-coordinate standard deviation, positive
/// * `rho_nt1` - correlation in (-1, 1)
///
/// The joint density has no separable feature axis; output is (n x t x 1)
/// regardless of `reduce_sum` (kept for signature uniformity).
pub fn logli_normal_bivariate(
    x_nt2: &Tensor,
    mu_nt2: &Tensor,
    sigma_nt2: &Tensor,
    rho_nt1: &Tensor,
    _reduce_sum: bool,
) -> Result<Tensor> {
    let dx = x_nt2
        .narrow(2, 0, 1)?
        .sub(&mu_nt2.narrow(2, 0, 1)?)?
        .div(&sigma_nt2.narrow(2, 0, 1)?)?;
    let dy = x_nt2
        .narrow(2, 1, 1)?
        .sub(&mu_nt2.narrow(2, 1, 1)?)?
        .div(&sigma_nt2.narrow(2, 1, 1)?)?;

    let one_minus_rho2 = (rho_nt1.sqr()?.neg()? + 1.0)?;
    let z = (dx.sqr()? + dy.sqr()?)?.sub(&(dx.mul(&dy)?.mul(rho_nt1)? * 2.0)?)?;

    let quad = z.div(&(one_minus_rho2.clone() * 2.0)?)?.neg()?;
    let log_norm = (sigma_nt2
        .narrow(2, 0, 1)?
        .log()?
        .add(&sigma_nt2.narrow(2, 1, 1)?.log()?)?
        + (one_minus_rho2.log()? * 0.5)?)?;

    (quad - log_norm)? - LN_2PI
}

/// Gaussian-mixture log-likelihood via max-shifted log-sum-exp
///
/// llik(i,t) = log sum_k pi_k * prod_j N(x_j; mu_kj, sigma_kj^2)
///
/// Raw component probabilities are never summed; the per-component
/// log-likelihoods are shifted by their maximum before exponentiation.
/// With one component and coefficient 1 this reduces exactly to
/// `logli_normal_isotropic(.., reduce_sum = true)`.
///
/// * `x_ntd` - target tensor (n x t x d)
/// * `mu_ntkd` - component means flattened as (n x t x k*d)
/// * `sigma_ntkd` - component standard deviations (n x t x k*d)
/// * `coeff_ntk` - mixture coefficients (n x t x k), summing to 1 over k
pub fn logli_gmm_logsumexp(
    x_ntd: &Tensor,
    mu_ntkd: &Tensor,
    sigma_ntkd: &Tensor,
    coeff_ntk: &Tensor,
) -> Result<Tensor> {
    let (n, t, d) = x_ntd.dims3()?;
    let k = coeff_ntk.dims3()?.2;

    let mu = mu_ntkd.reshape((n, t, k, d))?;
    let sigma = sigma_ntkd.reshape((n, t, k, d))?;
    let x = x_ntd.reshape((n, t, 1, d))?;

    let z = x.broadcast_sub(&mu)?.div(&sigma)?;
    let per_comp = ((z.sqr()? * 0.5)?.neg()? - sigma.log()?)?;
    // Sum the feature axis of each component: (n x t x k)
    let logli_k = ((per_comp - 0.5 * LN_2PI)?).sum(3)?;

    let log_weighted = logli_k.add(&coeff_ntk.log()?)?;
    let max_k = log_weighted.max_keepdim(2)?;
    let sum_exp = log_weighted.broadcast_sub(&max_k)?.exp()?.sum_keepdim(2)?;
    sum_exp.log()?.add(&max_k)
}

/// Bernoulli log-likelihood of binary-ish data
///
/// llik = x * log(p) + (1 - x) * log(1 - p)
///
/// * `x_ntd` - target tensor with entries in [0, 1]
/// * `prob_ntd` - predicted probabilities in (0, 1)
pub fn logli_bernoulli(x_ntd: &Tensor, prob_ntd: &Tensor, reduce_sum: bool) -> Result<Tensor> {
    let eps = 1e-6;
    let pos = x_ntd.mul(&(prob_ntd + eps)?.log()?)?;
    let neg = (x_ntd.neg()? + 1.0)?.mul(&(prob_ntd.neg()? + (1.0 + eps))?.log()?)?;
    reduce_features(pos.add(&neg)?, reduce_sum)
}

/// Categorical log-likelihood from unnormalized logits
///
/// llik(i,t) = sum_c label(i,t,c) * log_softmax(logit)(i,t,c)
///
/// Output keeps a singleton feature axis (n x t x 1).
pub fn logli_categorical(labels_ntc: &Tensor, logits_ntc: &Tensor) -> Result<Tensor> {
    let logp = candle_nn::ops::log_softmax(logits_ntc, D::Minus1)?;
    labels_ntc.mul(&logp)?.sum_keepdim(D::Minus1)
}

/// Per-element Bernoulli log-likelihood from logits, computed in a
/// numerically stable form:
///
/// llik = -( relu(l) - l*x + log(1 + exp(-|l|)) )
pub fn logli_bernoulli_logits(
    x_ntd: &Tensor,
    logits_ntd: &Tensor,
    reduce_sum: bool,
) -> Result<Tensor> {
    let bce = (logits_ntd.relu()? - logits_ntd.mul(x_ntd)?)?
        .add(&(logits_ntd.abs()?.neg()?.exp()? + 1.0)?.log()?)?;
    reduce_features(bce.neg()?, reduce_sum)
}

/// Analytic KL divergence between two diagonal Gaussians
///
/// KL(q || p) = log(sigma_p/sigma_q)
///              + (sigma_q^2 + (mu_q - mu_p)^2) / (2*sigma_p^2) - 0.5
///
/// Returned per-element (no implicit summation) unless `reduce_sum`, so the
/// caller can mask and reduce consistently with the likelihood terms.
pub fn kld_normal_isotropic(
    q_mu: &Tensor,
    q_sigma: &Tensor,
    p_mu: &Tensor,
    p_sigma: &Tensor,
    reduce_sum: bool,
) -> Result<Tensor> {
    let log_ratio = p_sigma.log()?.sub(&q_sigma.log()?)?;
    let num = q_sigma.sqr()?.add(&q_mu.sub(p_mu)?.sqr()?)?;
    let quad = num.div(&(p_sigma.sqr()? * 2.0)?)?;
    reduce_features((log_ratio.add(&quad)? - 0.5)?, reduce_sum)
}

/// Negative squared error as a pseudo log-likelihood, summed over features.
pub fn logli_mse(x_ntd: &Tensor, mu_ntd: &Tensor) -> Result<Tensor> {
    x_ntd.sub(mu_ntd)?.sqr()?.sum_keepdim(D::Minus1)?.neg()
}
